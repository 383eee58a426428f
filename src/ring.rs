//! Circular frame buffer shared by one stream's producer and its readers.
//!
//! Frame bytes live in a fixed arena; a fixed slot array records where each
//! frame sits. The writer fills slots and arena front to back and wraps both
//! to zero when either would overflow, evicting the oldest frames whose slot
//! or bytes get reused. Every frame carries a sequence number, so readers can
//! tell "nothing new" from "lapped by the writer".

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::error::RingError;
use crate::smoothing::PtsSmoother;
use crate::types::{ClientKind, FrameInfo, FrameRead, MediaFrame, MediaKind};

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// 0 marks an empty slot
    seq: u64,
    offset: usize,
    len: usize,
    info: Option<FrameInfo>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        seq: 0,
        offset: 0,
        len: 0,
        info: None,
    };
}

/// Per-client read position
#[derive(Debug, Clone, Copy, Default)]
struct ReadCursor {
    next_seq: u64,
    /// Has consumed (or been positioned on) an I-frame
    synced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RingStats {
    pub slot_capacity: usize,
    pub arena_bytes: usize,
    pub live_frames: u64,
    pub frames_written: u64,
    pub wraps: u64,
    pub high_water: usize,
    pub overruns: u64,
    pub smoothing_resets: u64,
}

struct RingState {
    arena: Vec<u8>,
    slots: Vec<Slot>,
    /// seq % capacity -> slot index, valid for live sequence numbers
    seq_index: Vec<usize>,
    next_index: usize,
    next_offset: usize,
    next_seq: u64,
    oldest_seq: u64,
    high_water: usize,
    anchor: Option<u64>,
    wraps: u64,
    smoother: PtsSmoother,
}

impl RingState {
    fn new(slot_capacity: usize, arena_bytes: usize) -> Self {
        Self {
            arena: vec![0; arena_bytes],
            slots: vec![Slot::EMPTY; slot_capacity],
            seq_index: vec![0; slot_capacity],
            next_index: 0,
            next_offset: 0,
            next_seq: 1,
            oldest_seq: 1,
            high_water: 0,
            anchor: None,
            wraps: 0,
            smoother: PtsSmoother::new(),
        }
    }

    fn slot_of(&self, seq: u64) -> Option<&Slot> {
        if seq < self.oldest_seq || seq >= self.next_seq {
            return None;
        }
        let index = self.seq_index[(seq % self.slots.len() as u64) as usize];
        let slot = &self.slots[index];
        (slot.seq == seq).then_some(slot)
    }

    fn live_anchor(&self) -> Option<u64> {
        self.anchor.filter(|seq| *seq >= self.oldest_seq)
    }

    fn evict_oldest(&mut self) {
        let seq = self.oldest_seq;
        let index = self.seq_index[(seq % self.slots.len() as u64) as usize];
        if self.slots[index].seq == seq {
            self.slots[index] = Slot::EMPTY;
        }
        if self.anchor == Some(seq) {
            self.anchor = None;
        }
        self.oldest_seq += 1;
    }

    fn oldest_slot_index(&self) -> Option<usize> {
        if self.oldest_seq >= self.next_seq {
            return None;
        }
        Some(self.seq_index[(self.oldest_seq % self.slots.len() as u64) as usize])
    }

    /// Position the writer for a frame of `len` bytes and free what it will reuse
    fn reserve(&mut self, len: usize) -> (usize, usize) {
        if self.next_index == self.slots.len() || self.next_offset + len > self.arena.len() {
            let lap_end = self.next_index;
            // frames left over from the lap before are older than everything written since
            while let Some(index) = self.oldest_slot_index() {
                if index < lap_end {
                    break;
                }
                self.evict_oldest();
            }
            self.next_index = 0;
            self.next_offset = 0;
            self.wraps += 1;
        }

        let index = self.next_index;
        let offset = self.next_offset;
        let end = offset + len;
        while let Some(old) = self.oldest_slot_index() {
            let slot = self.slots[old];
            let overlaps = slot.offset < end && offset < slot.offset + slot.len;
            if old == index || overlaps {
                self.evict_oldest();
            } else {
                break;
            }
        }
        (index, offset)
    }

    fn write(&mut self, frame: &MediaFrame, now_ms: i64) -> FrameInfo {
        let len = frame.data.len();
        let (index, offset) = self.reserve(len);

        self.arena[offset..offset + len].copy_from_slice(&frame.data);

        let display_ts_ms = match frame.kind {
            MediaKind::Video => self.smoother.video(frame.pts_ms, now_ms),
            MediaKind::Audio => self.smoother.audio(now_ms),
        };
        let seq = self.next_seq;
        let info = FrameInfo {
            seq,
            kind: frame.kind,
            codec: frame.codec,
            resolution: frame.resolution,
            is_iframe: frame.is_iframe && frame.kind == MediaKind::Video,
            capture_ts_ms: frame.pts_ms,
            display_ts_ms,
        };

        self.slots[index] = Slot {
            seq,
            offset,
            len,
            info: Some(info),
        };
        self.seq_index[(seq % self.slots.len() as u64) as usize] = index;
        if info.is_iframe {
            self.anchor = Some(seq);
        }

        self.next_seq += 1;
        self.next_index = index + 1;
        self.next_offset = offset + len;
        self.high_water = self.high_water.max(index);
        info
    }
}

/// Frame ring for one camera stream
pub struct FrameRing {
    label: String,
    state: RwLock<RingState>,
    cursors: Mutex<HashMap<ClientKind, ReadCursor>>,
    overruns: AtomicU64,
}

impl FrameRing {
    pub fn new(label: impl Into<String>, slot_capacity: usize, arena_bytes: usize) -> Self {
        Self {
            label: label.into(),
            state: RwLock::new(RingState::new(slot_capacity.max(1), arena_bytes.max(1))),
            cursors: Mutex::new(HashMap::new()),
            overruns: AtomicU64::new(0),
        }
    }

    /// Copy a frame into the ring and return the metadata recorded for it
    pub fn write(&self, frame: &MediaFrame, now_ms: i64) -> Result<FrameInfo, RingError> {
        let len = frame.data.len();
        if len == 0 {
            return Err(RingError::EmptyFrame);
        }
        let mut state = self.state.write();
        if len > state.arena.len() {
            return Err(RingError::FrameTooLarge {
                len,
                capacity: state.arena.len(),
            });
        }
        let info = state.write(frame, now_ms);
        trace!(ring = %self.label, seq = info.seq, len, iframe = info.is_iframe, "frame written");
        Ok(info)
    }

    /// Next unread frame for `client`, or `None` when it is caught up.
    ///
    /// A client that has not seen an I-frame yet, or that the writer lapped,
    /// is moved to the most recent I-frame first.
    pub fn read(&self, client: ClientKind) -> Option<FrameRead> {
        let mut cursors = self.cursors.lock();
        let state = self.state.read();
        let cursor = cursors.entry(client).or_insert_with(|| ReadCursor {
            next_seq: state.next_seq,
            synced: false,
        });

        let lapped = cursor.synced && cursor.next_seq < state.oldest_seq;
        if lapped {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            debug!(ring = %self.label, ?client, "reader lapped by writer, resyncing on I-frame");
        }
        if !cursor.synced || lapped {
            match state.live_anchor() {
                Some(anchor) => {
                    cursor.next_seq = anchor;
                    cursor.synced = true;
                }
                None => {
                    cursor.next_seq = state.next_seq;
                    cursor.synced = false;
                    return None;
                }
            }
        }

        if cursor.next_seq >= state.next_seq {
            return None;
        }

        let slot = state.slot_of(cursor.next_seq)?;
        let info = slot.info?;
        let data = Bytes::copy_from_slice(&state.arena[slot.offset..slot.offset + slot.len]);
        cursor.next_seq += 1;

        Some(FrameRead {
            data,
            info,
            frames_pending: state.next_seq - cursor.next_seq,
        })
    }

    /// Start (or restart) a client's cursor; it will begin at the next I-frame
    pub fn register_cursor(&self, client: ClientKind) {
        let next_seq = self.state.read().next_seq;
        self.cursors.lock().insert(
            client,
            ReadCursor {
                next_seq,
                synced: false,
            },
        );
    }

    pub fn remove_cursor(&self, client: ClientKind) {
        self.cursors.lock().remove(&client);
    }

    /// Drop every frame, e.g. after the stream was reconfigured
    pub fn clear(&self) {
        let mut cursors = self.cursors.lock();
        let mut state = self.state.write();
        let next_seq = state.next_seq;
        while state.oldest_seq < next_seq {
            state.evict_oldest();
        }
        state.next_index = 0;
        state.next_offset = 0;
        state.anchor = None;
        state.smoother = PtsSmoother::new();
        for cursor in cursors.values_mut() {
            cursor.next_seq = next_seq;
            cursor.synced = false;
        }
    }

    pub fn stats(&self) -> RingStats {
        let state = self.state.read();
        RingStats {
            slot_capacity: state.slots.len(),
            arena_bytes: state.arena.len(),
            live_frames: state.next_seq - state.oldest_seq,
            frames_written: state.next_seq - 1,
            wraps: state.wraps,
            high_water: state.high_water,
            overruns: self.overruns.load(Ordering::Relaxed),
            smoothing_resets: state.smoother.resets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const NOW: i64 = 1_700_000_000_000;

    fn frame(seq_tag: u64, size: usize, iframe: bool) -> MediaFrame {
        let mut data = vec![(seq_tag % 251) as u8; size.max(8)];
        data[..8].copy_from_slice(&seq_tag.to_le_bytes());
        MediaFrame::video(data, iframe, seq_tag as i64 * 40)
    }

    fn tag_of(read: &FrameRead) -> u64 {
        u64::from_le_bytes(read.data[..8].try_into().unwrap())
    }

    #[test]
    fn reads_back_in_write_order_with_exact_bytes() {
        let ring = FrameRing::new("test", 16, 4096);
        ring.register_cursor(ClientKind::Live);
        let written: Vec<MediaFrame> = (1..=10).map(|i| frame(i, 100 + i as usize, i == 1)).collect();
        for (i, f) in written.iter().enumerate() {
            ring.write(f, NOW + i as i64 * 40).unwrap();
        }

        for (i, expected) in written.iter().enumerate() {
            let read = ring.read(ClientKind::Live).expect("frame available");
            assert_eq!(read.data, expected.data);
            assert_eq!(read.info.seq, i as u64 + 1);
            assert_eq!(read.frames_pending, (written.len() - i - 1) as u64);
        }
        assert!(ring.read(ClientKind::Live).is_none());
    }

    #[test]
    fn fresh_reader_starts_at_latest_iframe() {
        let ring = FrameRing::new("test", 16, 4096);
        for (i, iframe) in [true, false, false, true, false].iter().enumerate() {
            ring.write(&frame(i as u64 + 1, 64, *iframe), NOW).unwrap();
        }

        let first = ring.read(ClientKind::Record).unwrap();
        assert!(first.info.is_iframe);
        assert_eq!(tag_of(&first), 4);
        assert_eq!(first.frames_pending, 1);
        assert_eq!(tag_of(&ring.read(ClientKind::Record).unwrap()), 5);
        assert!(ring.read(ClientKind::Record).is_none());
    }

    #[test]
    fn reader_waits_for_first_iframe() {
        let ring = FrameRing::new("test", 8, 1024);
        ring.register_cursor(ClientKind::Live);
        ring.write(&frame(1, 32, false), NOW).unwrap();
        ring.write(&frame(2, 32, false), NOW).unwrap();
        assert!(ring.read(ClientKind::Live).is_none());

        ring.write(&frame(3, 32, true), NOW).unwrap();
        ring.write(&frame(4, 32, false), NOW).unwrap();
        let read = ring.read(ClientKind::Live).unwrap();
        assert_eq!(tag_of(&read), 3);
        assert!(read.info.is_iframe);
    }

    #[test]
    fn slot_wrap_resyncs_lapped_reader() {
        let ring = FrameRing::new("test", 4, 1 << 16);
        ring.write(&frame(1, 16, true), NOW).unwrap();
        assert_eq!(tag_of(&ring.read(ClientKind::Live).unwrap()), 1);

        for tag in 2..=9 {
            ring.write(&frame(tag, 16, tag % 3 == 0), NOW).unwrap();
        }
        let read = ring.read(ClientKind::Live).unwrap();
        assert_eq!(tag_of(&read), 9);
        assert!(read.info.is_iframe);
        assert_eq!(ring.stats().overruns, 1);
        assert_eq!(ring.stats().live_frames, 4);
    }

    #[test]
    fn arena_wrap_evicts_overlapping_frames() {
        // three 30-byte frames fit per lap
        let ring = FrameRing::new("test", 100, 100);
        for tag in 1..=4 {
            ring.write(&frame(tag, 30, true), NOW).unwrap();
        }
        let stats = ring.stats();
        assert_eq!(stats.wraps, 1);
        assert_eq!(stats.live_frames, 3);
        assert_eq!(stats.high_water, 2);

        let read = ring.read(ClientKind::Live).unwrap();
        assert_eq!(tag_of(&read), 4);
    }

    #[test]
    fn oversized_and_empty_frames_are_refused() {
        let ring = FrameRing::new("test", 4, 64);
        assert_eq!(
            ring.write(&frame(1, 65, true), NOW),
            Err(RingError::FrameTooLarge { len: 65, capacity: 64 })
        );
        assert_eq!(
            ring.write(&MediaFrame::video(Vec::new(), true, 0), NOW),
            Err(RingError::EmptyFrame)
        );
        assert_eq!(ring.stats().frames_written, 0);
    }

    #[test]
    fn mixed_sizes_never_return_corrupt_frames() {
        let ring = FrameRing::new("test", 32, 2048);
        let mut rng = StdRng::seed_from_u64(7);
        let mut last_seen = 0u64;

        for tag in 1..=2000u64 {
            let size = rng.gen_range(8..400);
            ring.write(&frame(tag, size, tag % 10 == 1), NOW + tag as i64 * 40).unwrap();

            if rng.gen_bool(0.6) {
                while let Some(read) = ring.read(ClientKind::Live) {
                    let tag_read = tag_of(&read);
                    assert!(read.data[8..].iter().all(|b| *b == (tag_read % 251) as u8));
                    assert!(tag_read > last_seen, "reads must move forward");
                    assert!(read.info.seq >= 1);
                    last_seen = tag_read;
                    if rng.gen_bool(0.3) {
                        break;
                    }
                }
            }
        }
        assert!(last_seen > 0);
    }

    #[test]
    fn audio_is_readable_after_sync() {
        let ring = FrameRing::new("test", 16, 4096);
        let video = ring.write(&frame(1, 64, true), NOW).unwrap();
        let audio = ring.write(&MediaFrame::audio(vec![1u8; 160], 0), NOW).unwrap();
        assert_eq!(audio.kind, MediaKind::Audio);
        assert!(audio.display_ts_ms > video.display_ts_ms);

        assert!(ring.read(ClientKind::TwoWayAudio).unwrap().info.is_iframe);
        assert_eq!(ring.read(ClientKind::TwoWayAudio).unwrap().info.kind, MediaKind::Audio);
    }

    #[test]
    fn clear_drops_frames_and_resets_cursors() {
        let ring = FrameRing::new("test", 8, 1024);
        ring.write(&frame(1, 32, true), NOW).unwrap();
        ring.read(ClientKind::Live).unwrap();
        ring.write(&frame(2, 32, false), NOW).unwrap();
        ring.clear();
        assert_eq!(ring.stats().live_frames, 0);
        assert!(ring.read(ClientKind::Live).is_none());

        ring.write(&frame(3, 32, false), NOW).unwrap();
        assert!(ring.read(ClientKind::Live).is_none(), "needs a fresh I-frame after clear");
        ring.write(&frame(4, 32, true), NOW).unwrap();
        assert_eq!(tag_of(&ring.read(ClientKind::Live).unwrap()), 4);
    }
}
