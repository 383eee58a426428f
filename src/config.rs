use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::{StreamParams, StreamType};

/// Transport family used to reach a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraProtocol {
    Onvif,
    Http,
    Tcp,
    Rtsp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub index: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub host: String,
    pub control_port: u16,
    pub protocol: CameraProtocol,
    /// Probe the control port from the connectivity monitor
    #[serde(default = "default_true")]
    pub tcp_check: bool,
    #[serde(default)]
    pub ptz_supported: bool,
    #[serde(default)]
    pub main: StreamParams,
    #[serde(default = "default_sub_params")]
    pub sub: StreamParams,
}

fn default_true() -> bool {
    true
}

fn default_sub_params() -> StreamParams {
    StreamParams {
        resolution: crate::types::Resolution::new(640, 360),
        fps: 15,
        gop: 30,
        bitrate_kbps: 512,
        ..StreamParams::default()
    }
}

impl CameraConfig {
    pub fn new(index: usize, host: impl Into<String>, protocol: CameraProtocol) -> Self {
        let control_port = match protocol {
            CameraProtocol::Rtsp => 554,
            _ => 80,
        };
        Self {
            index,
            name: format!("camera {}", index),
            enabled: true,
            host: host.into(),
            control_port,
            protocol,
            tcp_check: true,
            ptz_supported: false,
            main: StreamParams::default(),
            sub: default_sub_params(),
        }
    }

    pub fn requires_tcp_check(&self) -> bool {
        self.enabled && self.tcp_check
    }

    pub fn params(&self, stream: StreamType) -> &StreamParams {
        match stream {
            StreamType::Main => &self.main,
            StreamType::Sub => &self.sub,
        }
    }
}

/// Live view of one camera's settings, updated by change notifications
pub type SharedCameraConfig = Arc<RwLock<CameraConfig>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub probe_period_ms: u64,
    /// How long a camera may fail probes before it is declared down
    pub video_loss_secs: u64,
    pub internet_probe_v4: String,
    pub internet_probe_v6: String,
    pub internet_confirm_samples: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_period_ms: 1000,
            video_loss_secs: 10,
            internet_probe_v4: "8.8.8.8:53".to_string(),
            internet_probe_v6: "[2001:4860:4860::8888]:53".to_string(),
            internet_confirm_samples: 3,
        }
    }
}

impl MonitorConfig {
    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_period_ms)
    }

    /// Consecutive failed probes needed to declare a camera down
    pub fn down_threshold(&self) -> u32 {
        let samples = (self.video_loss_secs * 1000) / self.probe_period_ms.max(1);
        samples.clamp(1, u32::MAX as u64) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub slot_capacity: usize,
    pub main_arena_bytes: usize,
    pub sub_arena_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            slot_capacity: 1000,
            main_arena_bytes: 8 * 1024 * 1024,
            sub_arena_bytes: 2 * 1024 * 1024,
        }
    }
}

impl BufferConfig {
    pub fn arena_bytes(&self, stream: StreamType) -> usize {
        match stream {
            StreamType::Main => self.main_arena_bytes,
            StreamType::Sub => self.sub_arena_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempt counter saturates here; it only feeds "retrying" notifications
    pub notify_cap: u32,
    /// Fractional jitter applied to each delay (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            notify_cap: 10,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtzConfig {
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            poll_interval_ms: 200,
            max_polls: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Triggers tolerated in OFF_WAIT before teardown is forced
    pub off_wait_unhandled_limit: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            off_wait_unhandled_limit: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ptz: PtzConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
}

fn default_web_port() -> u16 {
    8080
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            monitor: MonitorConfig::default(),
            buffer: BufferConfig::default(),
            retry: RetryConfig::default(),
            ptz: PtzConfig::default(),
            lifecycle: LifecycleConfig::default(),
            web_port: default_web_port(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Ok(config_str) = fs::read_to_string(path) {
            let config: AppConfig = serde_json::from_str(&config_str)?;
            config.validate()?;
            return Ok(config);
        }

        tracing::warn!("{} not found, using default configuration", path.display());
        Ok(AppConfig::default())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.probe_period_ms == 0 {
            return Err(ConfigError::Zero { field: "monitor.probe_period_ms" });
        }
        if self.buffer.slot_capacity == 0 {
            return Err(ConfigError::Zero { field: "buffer.slot_capacity" });
        }
        if self.buffer.main_arena_bytes == 0 || self.buffer.sub_arena_bytes == 0 {
            return Err(ConfigError::Zero { field: "buffer arena size" });
        }
        if self.ptz.queue_capacity == 0 {
            return Err(ConfigError::Zero { field: "ptz.queue_capacity" });
        }
        if self.ptz.max_polls == 0 {
            return Err(ConfigError::Zero { field: "ptz.max_polls" });
        }
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::Zero { field: "retry.base_delay_ms" });
        }

        let mut seen = vec![false; self.cameras.len()];
        for camera in &self.cameras {
            if let Some(slot) = seen.get_mut(camera.index) {
                if *slot {
                    return Err(ConfigError::DuplicateCamera(camera.index));
                }
                *slot = true;
            }
        }
        match seen.iter().position(|present| !present) {
            Some(missing) => Err(ConfigError::MissingCamera(missing)),
            None => Ok(()),
        }
    }
}
