//! Connectivity monitor: periodic TCP reachability probes for every enabled
//! camera plus one internet uplink probe, debounced with hysteresis.
//!
//! A camera is declared down once its failure counter reaches the threshold
//! derived from the video-loss duration; every successful probe decrements the
//! counter and the camera only comes back up when it has decayed to zero.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{MonitorConfig, SharedCameraConfig};
use crate::types::CameraIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Unknown,
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityRecord {
    pub state: Reachability,
    pub failures: u32,
    pub down_threshold: u32,
    pub last_ip: Option<IpAddr>,
    pub last_change: Option<DateTime<Utc>>,
    pub probes: u64,
    /// Bumped on every reset; results of probes started earlier are dropped
    pub epoch: u64,
}

impl ConnectivityRecord {
    pub fn new(down_threshold: u32) -> Self {
        Self {
            state: Reachability::Unknown,
            failures: 0,
            down_threshold: down_threshold.max(1),
            last_ip: None,
            last_change: None,
            probes: 0,
            epoch: 0,
        }
    }

    /// Feed one probe result; returns the new state if it changed
    pub fn sample(&mut self, success: bool) -> Option<Reachability> {
        self.probes += 1;
        if success {
            self.failures = self.failures.saturating_sub(1);
        } else {
            self.failures = (self.failures + 1).min(self.down_threshold);
        }

        let next = match self.state {
            Reachability::Unknown if success => Reachability::Up,
            Reachability::Unknown | Reachability::Up if self.failures >= self.down_threshold => {
                Reachability::Down
            }
            Reachability::Down if self.failures == 0 => Reachability::Up,
            current => current,
        };

        if next == self.state {
            return None;
        }
        self.state = next;
        self.last_change = Some(Utc::now());
        Some(next)
    }

    pub fn reset(&mut self) {
        let epoch = self.epoch + 1;
        *self = Self::new(self.down_threshold);
        self.epoch = epoch;
    }
}

/// Internet uplink hysteresis; alternates IPv4/IPv6 targets after a failure
#[derive(Debug)]
pub struct InternetProbe {
    targets: [String; 2],
    use_v6: bool,
    successes: u32,
    failures: u32,
    confirm: u32,
    flag: Arc<AtomicBool>,
}

impl InternetProbe {
    pub fn new(v4: String, v6: String, confirm: u32) -> Self {
        Self {
            targets: [v4, v6],
            use_v6: false,
            successes: 0,
            failures: 0,
            confirm: confirm.max(1),
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn target(&self) -> &str {
        &self.targets[usize::from(self.use_v6)]
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn sample(&mut self, success: bool) {
        let available = self.flag.load(Ordering::Relaxed);
        if success {
            self.failures = 0;
            self.successes = self.successes.saturating_add(1);
            if !available && self.successes >= self.confirm {
                info!("🌐 internet uplink available via {}", self.target());
                self.flag.store(true, Ordering::Relaxed);
            }
        } else {
            self.successes = 0;
            self.failures = self.failures.saturating_add(1);
            self.use_v6 = !self.use_v6;
            if available && self.failures >= self.confirm {
                warn!("🌐 internet uplink lost");
                self.flag.store(false, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub camera: CameraIndex,
    pub state: Reachability,
}

enum ProbeTarget {
    Camera(usize, u64),
    Internet,
}

pub struct ConnectivityMonitor {
    cameras: Vec<SharedCameraConfig>,
    records: Vec<Mutex<ConnectivityRecord>>,
    internet: Mutex<InternetProbe>,
    internet_flag: Arc<AtomicBool>,
    settings: MonitorConfig,
    events: mpsc::UnboundedSender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(
        cameras: Vec<SharedCameraConfig>,
        settings: MonitorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let threshold = settings.down_threshold();
        let records = cameras
            .iter()
            .map(|_| Mutex::new(ConnectivityRecord::new(threshold)))
            .collect();
        let internet = InternetProbe::new(
            settings.internet_probe_v4.clone(),
            settings.internet_probe_v6.clone(),
            settings.internet_confirm_samples,
        );
        let internet_flag = internet.flag();
        let monitor = Arc::new(Self {
            cameras,
            records,
            internet: Mutex::new(internet),
            internet_flag,
            settings,
            events,
        });
        (monitor, rx)
    }

    pub fn record(&self, camera: CameraIndex) -> Option<ConnectivityRecord> {
        self.records.get(camera.0).map(|r| r.lock().clone())
    }

    /// Forget what is known about a camera so the next cycle starts fresh
    pub fn reset(&self, camera: CameraIndex) {
        if let Some(record) = self.records.get(camera.0) {
            record.lock().reset();
            debug!(%camera, "connectivity record reset");
        }
    }

    pub fn internet_available(&self) -> bool {
        self.internet_flag.load(Ordering::Relaxed)
    }

    pub fn internet_flag(&self) -> Arc<AtomicBool> {
        self.internet_flag.clone()
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.probe_period();
        info!(
            "📡 connectivity monitor started: {} cameras, period {:?}, down after {} failures",
            self.cameras.len(),
            period,
            self.settings.down_threshold()
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_cycle().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("📡 connectivity monitor stopped");
    }

    /// Probe every camera and the uplink once, waiting at most one period
    pub async fn probe_cycle(&self) {
        let wait = self.settings.probe_period();
        let mut probes = JoinSet::new();

        for (index, camera) in self.cameras.iter().enumerate() {
            let (enabled, tcp_check, host, port) = {
                let camera = camera.read();
                (
                    camera.enabled,
                    camera.requires_tcp_check(),
                    camera.host.clone(),
                    camera.control_port,
                )
            };
            if !enabled {
                continue;
            }
            let (cached, epoch) = {
                let record = self.records[index].lock();
                (record.last_ip, record.epoch)
            };
            if !tcp_check {
                self.apply(index, epoch, Some(None));
                continue;
            }
            probes.spawn(async move {
                let outcome = probe_camera(&host, port, cached, wait).await;
                (ProbeTarget::Camera(index, epoch), outcome.map(Some))
            });
        }

        let internet = self.internet.lock().target().to_string();
        probes.spawn(async move {
            let outcome = probe_addr(&internet, wait).await;
            (ProbeTarget::Internet, outcome.map(|_| None))
        });

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((ProbeTarget::Camera(index, epoch), outcome)) => {
                    self.apply(index, epoch, outcome)
                }
                Ok((ProbeTarget::Internet, outcome)) => {
                    self.internet.lock().sample(outcome.is_some())
                }
                Err(e) => warn!("probe task failed: {}", e),
            }
        }
    }

    /// `Some(ip)` is a successful probe (`None` ip when no probe was needed)
    fn apply(&self, index: usize, epoch: u64, outcome: Option<Option<IpAddr>>) {
        let camera = CameraIndex(index);
        let change = {
            let mut record = self.records[index].lock();
            if record.epoch != epoch {
                debug!(%camera, "probe result from before reset dropped");
                return;
            }
            match outcome {
                Some(Some(ip)) => record.last_ip = Some(ip),
                Some(None) => {}
                // re-resolve next time in case the address moved
                None => record.last_ip = None,
            }
            record.sample(outcome.is_some())
        };

        if let Some(state) = change {
            match state {
                Reachability::Up => info!(%camera, "✅ camera reachable"),
                _ => warn!(%camera, "❌ camera unreachable"),
            }
            let _ = self.events.send(ConnectivityEvent { camera, state });
        }
    }
}

async fn probe_camera(
    host: &str,
    port: u16,
    cached: Option<IpAddr>,
    wait: Duration,
) -> Option<IpAddr> {
    let attempt = async {
        let addr = match cached {
            Some(ip) => SocketAddr::new(ip, port),
            None => lookup_host((host, port)).await.ok()?.next()?,
        };
        connect(addr).await
    };
    bounded(host, wait, attempt).await
}

async fn probe_addr(target: &str, wait: Duration) -> Option<IpAddr> {
    let attempt = async {
        let addr = lookup_host(target).await.ok()?.next()?;
        connect(addr).await
    };
    bounded(target, wait, attempt).await
}

/// Resolution and connect share one deadline so a slow resolver cannot stall the cycle
async fn bounded<F>(target: &str, wait: Duration, attempt: F) -> Option<IpAddr>
where
    F: Future<Output = Option<IpAddr>>,
{
    match timeout(wait, attempt).await {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!("probe {} timed out", target);
            None
        }
    }
}

async fn connect(addr: SocketAddr) -> Option<IpAddr> {
    match TcpStream::connect(addr).await {
        Ok(_stream) => Some(addr.ip()),
        Err(e) => {
            debug!("probe {} failed: {}", addr, e);
            None
        }
    }
}
