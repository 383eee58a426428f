//! Presentation-time smoothing for frames entering the ring buffer.
//!
//! Raw camera PTS is jittery and occasionally jumps. Video display timestamps
//! are advanced from the previous output by the average inter-frame delta
//! over a rolling window, and re-seeded from the wall clock when the camera
//! clock or the system clock misbehaves.

use std::collections::VecDeque;
use tracing::debug;

pub const WARMUP_FRAMES: usize = 250;
pub const WINDOW_FRAMES: usize = 100;
/// Spacing for audio frames relative to the last emitted timestamp
pub const AUDIO_STEP_MS: i64 = 3;

const MAX_PTS_JUMP_MS: i64 = 1000;
const MAX_STEP_MS: f64 = 1000.0;
const SNAP_DRIFT_MS: f64 = 2000.0;
const RESET_DRIFT_MS: f64 = 30_000.0;

#[derive(Debug, Default)]
pub struct PtsSmoother {
    deltas: VecDeque<i64>,
    sum: i64,
    warmed_up: bool,
    last_raw_pts: Option<i64>,
    synthetic: f64,
    last_video_ms: Option<i64>,
    last_audio_ms: Option<i64>,
    resets: u64,
}

impl PtsSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the smoothing state was thrown away
    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn average_delta_ms(&self) -> Option<f64> {
        if self.deltas.is_empty() {
            None
        } else {
            Some(self.sum as f64 / self.deltas.len() as f64)
        }
    }

    /// Assign a display timestamp to a video frame.
    ///
    /// `pts_ms` is the camera clock, `now_ms` the wall clock (ms since epoch).
    pub fn video(&mut self, pts_ms: i64, now_ms: i64) -> i64 {
        let Some(last_raw) = self.last_raw_pts else {
            return self.reseed(pts_ms, now_ms, true);
        };

        let raw_delta = pts_ms - last_raw;
        if raw_delta.abs() > MAX_PTS_JUMP_MS {
            debug!(raw_delta, "camera PTS jumped, resetting smoothing");
            return self.reseed(pts_ms, now_ms, true);
        }

        self.last_raw_pts = Some(pts_ms);
        self.push_delta(raw_delta.max(0));

        let average = self.average_delta_ms().unwrap_or(0.0);
        if average > MAX_STEP_MS {
            debug!(average, "average frame interval too large, resetting");
            return self.reseed(pts_ms, now_ms, true);
        }
        let mut next = self.synthetic + average;

        let drift = now_ms as f64 - next;
        if drift.abs() > RESET_DRIFT_MS {
            debug!(drift, "wall clock diverged, full smoothing reset");
            return self.reseed(pts_ms, now_ms, false);
        }
        if drift > SNAP_DRIFT_MS {
            next = now_ms as f64;
        } else if drift < -SNAP_DRIFT_MS {
            // running ahead of the wall clock: crawl until it catches up
            next = self.synthetic + 1.0;
        }

        self.emit_video(next)
    }

    /// Assign a display timestamp to an audio frame
    pub fn audio(&mut self, now_ms: i64) -> i64 {
        let base = match (self.last_video_ms, self.last_audio_ms) {
            (Some(v), Some(a)) => Some(v.max(a)),
            (v, a) => v.or(a),
        };
        let mut out = match base {
            Some(base) => base + AUDIO_STEP_MS,
            None => now_ms,
        };
        if (now_ms - out) as f64 > SNAP_DRIFT_MS {
            out = now_ms;
        }
        self.last_audio_ms = Some(out);
        out
    }

    fn push_delta(&mut self, delta: i64) {
        self.deltas.push_back(delta);
        self.sum += delta;

        if !self.warmed_up && self.deltas.len() >= WARMUP_FRAMES {
            self.warmed_up = true;
        }
        let limit = if self.warmed_up { WINDOW_FRAMES } else { WARMUP_FRAMES };
        while self.deltas.len() > limit {
            if let Some(old) = self.deltas.pop_front() {
                self.sum -= old;
            }
        }
    }

    fn reseed(&mut self, pts_ms: i64, now_ms: i64, keep_monotonic: bool) -> i64 {
        if self.last_raw_pts.is_some() {
            self.resets += 1;
        }
        self.deltas.clear();
        self.sum = 0;
        self.warmed_up = false;
        self.last_raw_pts = Some(pts_ms);
        if !keep_monotonic {
            self.last_video_ms = None;
            self.last_audio_ms = None;
        }
        self.emit_video(now_ms as f64)
    }

    fn emit_video(&mut self, next: f64) -> i64 {
        let rounded = next.round() as i64;
        let out = match self.last_video_ms {
            Some(last) if rounded <= last => last + 1,
            _ => rounded,
        };
        self.synthetic = if out > rounded { out as f64 } else { next };
        self.last_video_ms = Some(out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPOCH: i64 = 1_700_000_000_000;

    #[test]
    fn constant_delta_converges_after_warmup() {
        let mut smoother = PtsSmoother::new();
        let delta = 40;
        let mut previous = None;
        for i in 0..(WARMUP_FRAMES as i64 + 50) {
            let out = smoother.video(90_000 + i * delta, EPOCH + i * delta);
            if let Some(prev) = previous {
                assert!(out > prev, "timestamps must be monotonic");
                if i > WARMUP_FRAMES as i64 {
                    assert!((out - prev - delta).abs() <= 1, "step {} at frame {}", out - prev, i);
                }
            }
            previous = Some(out);
        }
        assert_eq!(smoother.resets(), 0);
    }

    #[test]
    fn fractional_rate_does_not_drift() {
        let mut smoother = PtsSmoother::new();
        // 30 fps with millisecond PTS alternates 33/34/33
        let pts_at = |i: i64| i * 1000 / 30;
        let first = smoother.video(0, EPOCH);
        let mut last = first;
        for i in 1..600i64 {
            last = smoother.video(pts_at(i), EPOCH + pts_at(i));
        }
        let pts = pts_at(599);
        let elapsed = last - first;
        assert!((elapsed - pts).abs() <= 5, "elapsed {} vs pts {}", elapsed, pts);
    }

    #[test]
    fn pts_regression_resets_without_going_backwards() {
        let mut smoother = PtsSmoother::new();
        let mut last = 0;
        for i in 0..20 {
            last = smoother.video(50_000 + i * 40, EPOCH + i * 40);
        }
        // camera clock jumps back five seconds; wall clock also lags the synthetic clock
        let after = smoother.video(45_000, EPOCH);
        assert!(after > last);
        assert_eq!(smoother.resets(), 1);
        assert_eq!(smoother.average_delta_ms(), None);
    }

    #[test]
    fn forward_jump_also_resets() {
        let mut smoother = PtsSmoother::new();
        smoother.video(0, EPOCH);
        smoother.video(40, EPOCH + 40);
        let out = smoother.video(10_000, EPOCH + 80);
        assert_eq!(out, EPOCH + 80);
        assert_eq!(smoother.resets(), 1);
    }

    #[test]
    fn lagging_synthetic_clock_snaps_to_wall_clock() {
        let mut smoother = PtsSmoother::new();
        for i in 0..10 {
            smoother.video(i * 40, EPOCH + i * 40);
        }
        // camera PTS keeps a 40ms cadence but the wall clock is 5s ahead
        let out = smoother.video(400, EPOCH + 5_400);
        assert_eq!(out, EPOCH + 5_400);
        assert_eq!(smoother.resets(), 0);
    }

    #[test]
    fn large_wall_clock_divergence_reseeds() {
        let mut smoother = PtsSmoother::new();
        for i in 0..10 {
            smoother.video(i * 40, EPOCH + i * 40);
        }
        let out = smoother.video(400, EPOCH - 60_000);
        assert_eq!(out, EPOCH - 60_000);
        assert_eq!(smoother.resets(), 1);
    }

    #[test]
    fn audio_is_spaced_from_last_timestamp() {
        let mut smoother = PtsSmoother::new();
        assert_eq!(smoother.audio(EPOCH), EPOCH);
        assert_eq!(smoother.audio(EPOCH + 1), EPOCH + AUDIO_STEP_MS);

        let video = smoother.video(0, EPOCH + 100);
        assert_eq!(smoother.audio(EPOCH + 101), video + AUDIO_STEP_MS);
        assert_eq!(smoother.audio(EPOCH + 102), video + 2 * AUDIO_STEP_MS);
    }
}
