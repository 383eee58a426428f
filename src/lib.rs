//! Camera interface core for a network video recorder.
//!
//! Each configured camera gets two stream lifecycle actors (main and sub),
//! a frame ring per stream, a PTZ command queue and a slot in the shared
//! connectivity monitor. Protocol specifics stay behind [`ProtocolAdapter`].

pub mod adapter;
pub mod config;
pub mod error;
pub mod monitor;
pub mod onvif;
pub mod ptz;
pub mod registry;
pub mod ring;
pub mod smoothing;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod web;

pub use adapter::{CameraEvents, ProtocolAdapter};
pub use config::AppConfig;
pub use error::{CoreError, ErrorKind};
pub use registry::CameraCore;
