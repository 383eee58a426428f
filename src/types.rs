use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a camera in the registry (0-based, dense)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraIndex(pub usize);

impl fmt::Display for CameraIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{:02}", self.0)
    }
}

/// Which of the two profiles a camera exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Main,
    Sub,
}

impl StreamType {
    pub const ALL: [StreamType; 2] = [StreamType::Main, StreamType::Sub];

    pub fn slot(self) -> usize {
        match self {
            StreamType::Main => 0,
            StreamType::Sub => 1,
        }
    }

    pub fn slot_name(self) -> &'static str {
        match self {
            StreamType::Main => "main",
            StreamType::Sub => "sub",
        }
    }
}

/// Internal consumers that can register interest in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Live,
    Record,
    TwoWayAudio,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Mjpeg,
    G711,
    Aac,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A frame as delivered by the protocol adapter
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub kind: MediaKind,
    pub codec: Codec,
    pub resolution: Resolution,
    pub is_iframe: bool,
    /// Camera-supplied presentation time in milliseconds
    pub pts_ms: i64,
}

impl MediaFrame {
    pub fn video(data: impl Into<Bytes>, is_iframe: bool, pts_ms: i64) -> Self {
        Self {
            data: data.into(),
            kind: MediaKind::Video,
            codec: Codec::H264,
            resolution: Resolution::default(),
            is_iframe,
            pts_ms,
        }
    }

    pub fn audio(data: impl Into<Bytes>, pts_ms: i64) -> Self {
        Self {
            data: data.into(),
            kind: MediaKind::Audio,
            codec: Codec::G711,
            resolution: Resolution::default(),
            is_iframe: false,
            pts_ms,
        }
    }
}

/// Per-slot metadata recorded by the ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameInfo {
    pub seq: u64,
    pub kind: MediaKind,
    pub codec: Codec,
    pub resolution: Resolution,
    pub is_iframe: bool,
    /// Raw camera PTS (ms)
    pub capture_ts_ms: i64,
    /// Smoothed display timestamp (ms since the Unix epoch)
    pub display_ts_ms: i64,
}

/// Result of a successful `next_frame` poll
#[derive(Debug, Clone)]
pub struct FrameRead {
    pub data: Bytes,
    pub info: FrameInfo,
    /// Frames written after this one that the cursor has not consumed yet
    pub frames_pending: u64,
}

/// Stream parameters negotiated with (or pushed to) the camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    pub codec: Codec,
    pub resolution: Resolution,
    pub fps: u32,
    pub gop: u32,
    pub bitrate_kbps: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            resolution: Resolution::new(1920, 1080),
            fps: 25,
            gop: 50,
            bitrate_kbps: 4096,
        }
    }
}

/// Running statistics about a stream, refreshed by the state machine
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub fps: f64,
    pub gop_length: u32,
    pub resolution: Resolution,
    pub codec: Codec,
    pub configured_fps: u32,
    pub frames_received: u64,
}
