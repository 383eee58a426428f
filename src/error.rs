use serde::Serialize;
use thiserror::Error;

use crate::types::{CameraIndex, ClientKind, StreamType};

/// Failure classes shared by the stream machine, the PTZ worker and clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Camera turned off in configuration; never retried
    ChannelDisabled,
    /// Reachability probe failed; retried only after the camera is reachable again
    Disconnected,
    /// Adapter error or timeout while reachable; retried with backoff
    Transient,
    /// ONVIF discovery incomplete; retried through the discovery sequence
    Capability,
    /// Too many concurrent protocol sessions; surfaced, not retried
    ResourceLimit,
}

/// Synchronous refusal from a protocol adapter at the call site
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("channel disabled")]
    Disabled,
    #[error("camera disconnected")]
    Disconnected,
    #[error("resource limit reached: {0}")]
    ResourceLimit(String),
    #[error("capability unknown: {0}")]
    Capability(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Disabled => ErrorKind::ChannelDisabled,
            AdapterError::Disconnected => ErrorKind::Disconnected,
            AdapterError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            AdapterError::Capability(_) => ErrorKind::Capability,
            AdapterError::Transport(_) => ErrorKind::Transient,
        }
    }
}

/// Errors returned to callers of the camera core
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("unknown camera {0}")]
    UnknownCamera(CameraIndex),
    #[error("camera {0} is disabled")]
    ChannelDisabled(CameraIndex),
    #[error("stream {camera}/{stream:?} is shut down")]
    StreamShutDown { camera: CameraIndex, stream: StreamType },
    #[error("client {0:?} is not registered on this stream")]
    UnknownClient(ClientKind),
    #[error("adapter refused request: {0}")]
    Adapter(#[from] AdapterError),
}

impl CoreError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CoreError::ChannelDisabled(_) => Some(ErrorKind::ChannelDisabled),
            CoreError::Adapter(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("frame of {len} bytes exceeds arena capacity {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },
    #[error("empty frame")]
    EmptyFrame,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("camera index {0} is configured more than once")]
    DuplicateCamera(usize),
    #[error("camera indices must be dense: missing {0}")]
    MissingCamera(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_map_to_taxonomy() {
        assert_eq!(AdapterError::Disabled.kind(), ErrorKind::ChannelDisabled);
        assert_eq!(
            AdapterError::ResourceLimit("rtsp sessions".into()).kind(),
            ErrorKind::ResourceLimit
        );
        assert_eq!(AdapterError::Transport("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(AdapterError::Disconnected.kind(), ErrorKind::Disconnected);
    }

    #[test]
    fn core_error_exposes_kind() {
        let err: CoreError = AdapterError::ResourceLimit("max 4".into()).into();
        assert_eq!(err.kind(), Some(ErrorKind::ResourceLimit));
        assert_eq!(CoreError::UnknownCamera(CameraIndex(3)).kind(), None);
        assert_eq!(err.to_string(), "adapter refused request: resource limit reached: max 4");
    }
}
