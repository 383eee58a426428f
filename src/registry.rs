//! `CameraCore`: the per-camera resources built once from the configured
//! camera list, and the surface the rest of the NVR talks to.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{CameraEvents, ProtocolAdapter};
use crate::config::{AppConfig, CameraProtocol, SharedCameraConfig};
use crate::error::{ConfigError, CoreError};
use crate::monitor::{ConnectivityEvent, ConnectivityMonitor, ConnectivityRecord, Reachability};
use crate::onvif::{DiscoveryRecord, OnvifDiscovery};
use crate::ptz::{
    PtzCallback, PtzCommand, PtzFunction, PtzOutcome, PtzQueue, PtzStats, SessionId,
};
use crate::ring::{FrameRing, RingStats};
use crate::stream::{
    ClientCallback, LinkState, ProbeReset, RetryPolicy, StreamDeps, StreamHandle, StreamStatus,
    Trigger,
};
use crate::types::{CameraIndex, ClientKind, FrameRead, StreamParams, StreamType};

struct CameraSlot {
    config: SharedCameraConfig,
    discovery: Arc<OnvifDiscovery>,
    streams: [StreamHandle; 2],
    ptz: Arc<PtzQueue>,
}

impl CameraSlot {
    fn stream(&self, stream: StreamType) -> &StreamHandle {
        &self.streams[stream.slot()]
    }

    fn broadcast(&self, link: LinkState) {
        for handle in &self.streams {
            if let Err(e) = handle.send(Trigger::Connectivity(link)) {
                warn!("connectivity not delivered: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamView {
    #[serde(flatten)]
    pub status: StreamStatus,
    pub ring: RingStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub index: CameraIndex,
    pub name: String,
    pub host: String,
    pub protocol: CameraProtocol,
    pub enabled: bool,
    pub connectivity: Option<ConnectivityRecord>,
    pub onvif: DiscoveryRecord,
    pub streams: Vec<StreamView>,
    pub ptz: PtzStats,
}

pub struct CameraCore {
    cameras: Vec<CameraSlot>,
    monitor: Arc<ConnectivityMonitor>,
    monitor_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
    shutdown: watch::Sender<bool>,
    stream_tasks: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CameraCore {
    /// Build every per-camera resource. Must be called inside a tokio runtime.
    pub fn new(
        config: &AppConfig,
        adapter: Arc<dyn ProtocolAdapter>,
        events: Arc<dyn CameraEvents>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let mut cameras_cfg = config.cameras.clone();
        cameras_cfg.sort_by_key(|c| c.index);
        let shared: Vec<SharedCameraConfig> = cameras_cfg
            .into_iter()
            .map(|c| Arc::new(RwLock::new(c)))
            .collect();

        let (monitor, monitor_events) =
            ConnectivityMonitor::new(shared.clone(), config.monitor.clone());
        let probe_reset: ProbeReset = {
            let monitor = monitor.clone();
            Arc::new(move |camera| monitor.reset(camera))
        };
        let retry = RetryPolicy::from_config(&config.retry);
        let runtime = Handle::current();

        let mut stream_tasks = Vec::new();
        let mut cameras = Vec::with_capacity(shared.len());
        for camera_cfg in shared {
            let index = CameraIndex(camera_cfg.read().index);
            let discovery = Arc::new(OnvifDiscovery::new());

            let mut spawn = |stream: StreamType| {
                let ring = Arc::new(FrameRing::new(
                    format!("{}/{}", index, stream.slot_name()),
                    config.buffer.slot_capacity,
                    config.buffer.arena_bytes(stream),
                ));
                let deps = StreamDeps {
                    config: camera_cfg.clone(),
                    adapter: adapter.clone(),
                    events: events.clone(),
                    discovery: discovery.clone(),
                    ring,
                    retry: retry.clone(),
                    off_wait_limit: config.lifecycle.off_wait_unhandled_limit,
                    probe_reset: Some(probe_reset.clone()),
                };
                let (handle, task) = StreamHandle::spawn(index, stream, deps);
                stream_tasks.push(task);
                handle
            };
            let streams = [spawn(StreamType::Main), spawn(StreamType::Sub)];

            let ptz = PtzQueue::new(
                index,
                camera_cfg.clone(),
                adapter.clone(),
                config.ptz.clone(),
                runtime.clone(),
            );
            cameras.push(CameraSlot {
                config: camera_cfg,
                discovery,
                streams,
                ptz,
            });
        }

        info!("📹 camera core built for {} cameras", cameras.len());
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            cameras,
            monitor,
            monitor_events: Mutex::new(Some(monitor_events)),
            shutdown,
            stream_tasks: Mutex::new(stream_tasks),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Start the connectivity monitor and feed its events to the streams
    pub fn run(self: &Arc<Self>) {
        let Some(mut events) = self.monitor_events.lock().take() else {
            warn!("camera core already running");
            return;
        };

        let monitor_task = tokio::spawn(self.monitor.clone().run(self.shutdown.subscribe()));

        let core = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let forward_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => core.on_connectivity(event),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("connectivity forwarding stopped");
        });

        self.background.lock().extend([monitor_task, forward_task]);
    }

    pub fn on_connectivity(&self, event: ConnectivityEvent) {
        let Some(slot) = self.cameras.get(event.camera.0) else {
            return;
        };
        match event.state {
            Reachability::Up => slot.broadcast(LinkState::Reachable),
            Reachability::Down => {
                slot.discovery.reset();
                slot.broadcast(LinkState::Unreachable);
            }
            Reachability::Unknown => {}
        }
    }

    fn slot(&self, camera: CameraIndex) -> Result<&CameraSlot, CoreError> {
        self.cameras
            .get(camera.0)
            .ok_or(CoreError::UnknownCamera(camera))
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub async fn start_stream(
        &self,
        camera: CameraIndex,
        stream: StreamType,
        client: ClientKind,
        callback: ClientCallback,
    ) -> Result<(), CoreError> {
        let handle = self.slot(camera)?.stream(stream).clone();
        handle.start(client, callback).await
    }

    pub fn stop_stream(
        &self,
        camera: CameraIndex,
        stream: StreamType,
        client: ClientKind,
    ) -> Result<(), CoreError> {
        self.slot(camera)?.stream(stream).stop(client)
    }

    /// Non-blocking poll for the client's next frame
    pub fn next_frame(
        &self,
        camera: CameraIndex,
        stream: StreamType,
        client: ClientKind,
    ) -> Result<Option<FrameRead>, CoreError> {
        self.slot(camera)?.stream(stream).next_frame(client)
    }

    pub fn camera_enabled(&self, camera: CameraIndex, enabled: bool) -> Result<(), CoreError> {
        let slot = self.slot(camera)?;
        let changed = {
            let mut config = slot.config.write();
            let changed = config.enabled != enabled;
            config.enabled = enabled;
            changed
        };
        if changed {
            info!(%camera, enabled, "camera enable changed");
            self.monitor.reset(camera);
        }
        // streams refused by the camera itself only clear on a fresh Enabled
        slot.broadcast(if enabled {
            LinkState::Enabled
        } else {
            LinkState::Disabled
        });
        Ok(())
    }

    pub fn stream_params_changed(
        &self,
        camera: CameraIndex,
        stream: StreamType,
        params: StreamParams,
    ) -> Result<(), CoreError> {
        let slot = self.slot(camera)?;
        {
            let mut config = slot.config.write();
            match stream {
                StreamType::Main => config.main = params,
                StreamType::Sub => config.sub = params,
            }
        }
        slot.stream(stream).send(Trigger::ConfigChange)
    }

    /// New address or credentials: drop everything known and re-probe
    pub fn camera_address_changed(
        &self,
        camera: CameraIndex,
        host: String,
        control_port: u16,
    ) -> Result<(), CoreError> {
        let slot = self.slot(camera)?;
        {
            let mut config = slot.config.write();
            config.host = host;
            config.control_port = control_port;
        }
        info!(%camera, "camera address changed, resetting");
        slot.discovery.reset();
        self.monitor.reset(camera);
        slot.broadcast(LinkState::Unreachable);
        Ok(())
    }

    fn ptz(
        &self,
        camera: CameraIndex,
        session: SessionId,
        command: PtzCommand,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        match self.cameras.get(camera.0) {
            Some(slot) => slot.ptz.enqueue(session, command, callback),
            None => PtzOutcome::Rejected,
        }
    }

    pub fn set_ptz_position(
        &self,
        camera: CameraIndex,
        session: SessionId,
        pan: i8,
        tilt: i8,
        zoom: i8,
        speed: u8,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        self.ptz(camera, session, PtzCommand::pan_tilt_zoom(pan, tilt, zoom, speed), callback)
    }

    pub fn set_focus(
        &self,
        camera: CameraIndex,
        session: SessionId,
        direction: i8,
        speed: u8,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        self.ptz(camera, session, PtzCommand::focus(direction, speed), callback)
    }

    pub fn set_iris(
        &self,
        camera: CameraIndex,
        session: SessionId,
        direction: i8,
        speed: u8,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        self.ptz(camera, session, PtzCommand::iris(direction, speed), callback)
    }

    pub fn goto_preset(
        &self,
        camera: CameraIndex,
        session: SessionId,
        preset: u16,
        speed: u8,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        self.ptz(camera, session, PtzCommand::preset(preset, speed), callback)
    }

    pub fn stop_ptz(
        &self,
        camera: CameraIndex,
        session: SessionId,
        function: PtzFunction,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        self.ptz(camera, session, PtzCommand::stop(function), callback)
    }

    pub fn stream_status(
        &self,
        camera: CameraIndex,
        stream: StreamType,
    ) -> Result<StreamStatus, CoreError> {
        Ok(self.slot(camera)?.stream(stream).status())
    }

    pub fn subscribe_status(
        &self,
        camera: CameraIndex,
        stream: StreamType,
    ) -> Result<watch::Receiver<StreamStatus>, CoreError> {
        Ok(self.slot(camera)?.stream(stream).subscribe())
    }

    pub fn camera_status(&self, camera: CameraIndex) -> Result<CameraStatus, CoreError> {
        let slot = self.slot(camera)?;
        let config = slot.config.read().clone();
        Ok(CameraStatus {
            index: camera,
            name: config.name,
            host: config.host,
            protocol: config.protocol,
            enabled: config.enabled,
            connectivity: self.monitor.record(camera),
            onvif: slot.discovery.snapshot(),
            streams: slot
                .streams
                .iter()
                .map(|handle| StreamView {
                    status: handle.status(),
                    ring: handle.ring().stats(),
                })
                .collect(),
            ptz: slot.ptz.stats(),
        })
    }

    pub fn cameras(&self) -> Vec<CameraStatus> {
        (0..self.camera_count())
            .filter_map(|i| self.camera_status(CameraIndex(i)).ok())
            .collect()
    }

    pub fn internet_available(&self) -> bool {
        self.monitor.internet_available()
    }

    /// Stop the monitor, every stream actor and every PTZ worker
    pub async fn shutdown(&self) {
        info!("🛑 shutting down camera core");
        self.shutdown.send_replace(true);

        for slot in &self.cameras {
            for handle in &slot.streams {
                let _ = handle.send(Trigger::Shutdown);
            }
        }
        let streams = std::mem::take(&mut *self.stream_tasks.lock());
        for task in streams {
            if let Err(e) = task.await {
                warn!("stream task ended abnormally: {}", e);
            }
        }

        for slot in &self.cameras {
            slot.ptz.shutdown().await;
        }

        let background = std::mem::take(&mut *self.background.lock());
        for task in background {
            if let Err(e) = task.await {
                warn!("background task ended abnormally: {}", e);
            }
        }
        info!("✅ camera core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterStatus, LoggingAdapter, MediaEvent, NoopEvents, ProtocolAdapter, ReplyPayload,
        Request,
    };
    use crate::config::CameraConfig;
    use crate::error::AdapterError;
    use crate::stream::StreamState;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Refuses stream configuration as a disabled channel while `refuse` is set
    struct RefusingAdapter {
        refuse: AtomicBool,
    }

    impl ProtocolAdapter for RefusingAdapter {
        fn send_request(&self, request: Request) -> Result<(), AdapterError> {
            if request.descriptor.operation.is_media() {
                request.reply.media(MediaEvent::Ack(AdapterStatus::Ok));
            } else if self.refuse.load(Ordering::SeqCst) {
                request.reply.control(AdapterStatus::Disabled, ReplyPayload::None);
            } else {
                request.reply.control(AdapterStatus::Ok, ReplyPayload::None);
            }
            Ok(())
        }
    }

    fn core_with(cameras: Vec<CameraConfig>) -> Arc<CameraCore> {
        let config = AppConfig {
            cameras,
            ..AppConfig::default()
        };
        CameraCore::new(&config, Arc::new(LoggingAdapter), Arc::new(NoopEvents)).unwrap()
    }

    #[tokio::test]
    async fn unknown_camera_is_reported() {
        let core = core_with(vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Http)]);
        assert_eq!(
            core.stop_stream(CameraIndex(4), StreamType::Main, ClientKind::Live),
            Err(CoreError::UnknownCamera(CameraIndex(4)))
        );
        assert_eq!(
            core.goto_preset(CameraIndex(4), SessionId(1), 1, 10, None),
            PtzOutcome::Rejected
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn connectivity_events_drive_both_streams() {
        let core = core_with(vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Onvif)]);
        core.on_connectivity(ConnectivityEvent {
            camera: CameraIndex(0),
            state: Reachability::Up,
        });

        for stream in StreamType::ALL {
            let mut status = core.subscribe_status(CameraIndex(0), stream).unwrap();
            status
                .wait_for(|s| s.state == StreamState::Ready)
                .await
                .unwrap();
        }
        assert!(core.camera_status(CameraIndex(0)).unwrap().onvif.capabilities.is_some());

        core.on_connectivity(ConnectivityEvent {
            camera: CameraIndex(0),
            state: Reachability::Down,
        });
        let mut status = core.subscribe_status(CameraIndex(0), StreamType::Sub).unwrap();
        status
            .wait_for(|s| s.state == StreamState::Off && !s.reachable)
            .await
            .unwrap();
        assert!(core.camera_status(CameraIndex(0)).unwrap().onvif.entry_point.is_none());
        core.shutdown().await;
    }

    #[tokio::test]
    async fn disabling_a_camera_refuses_new_clients() {
        let core = core_with(vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Http)]);
        core.camera_enabled(CameraIndex(0), false).unwrap();
        let result = core
            .start_stream(CameraIndex(0), StreamType::Main, ClientKind::Live, Arc::new(|_| {}))
            .await;
        assert_eq!(result, Err(CoreError::ChannelDisabled(CameraIndex(0))));
        assert!(!core.camera_status(CameraIndex(0)).unwrap().enabled);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn channel_refused_by_camera_recovers_on_enable() {
        let adapter = Arc::new(RefusingAdapter {
            refuse: AtomicBool::new(true),
        });
        let config = AppConfig {
            cameras: vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Http)],
            ..AppConfig::default()
        };
        let core = CameraCore::new(&config, adapter.clone(), Arc::new(NoopEvents)).unwrap();
        core.on_connectivity(ConnectivityEvent {
            camera: CameraIndex(0),
            state: Reachability::Up,
        });
        let mut status = core.subscribe_status(CameraIndex(0), StreamType::Main).unwrap();
        status
            .wait_for(|s| s.disabled && s.state == StreamState::Off)
            .await
            .unwrap();

        let result = core
            .start_stream(CameraIndex(0), StreamType::Main, ClientKind::Live, Arc::new(|_| {}))
            .await;
        assert_eq!(result, Err(CoreError::ChannelDisabled(CameraIndex(0))));

        adapter.refuse.store(false, Ordering::SeqCst);
        core.camera_enabled(CameraIndex(0), true).unwrap();
        status
            .wait_for(|s| !s.disabled && s.state == StreamState::Ready)
            .await
            .unwrap();
        core.shutdown().await;
    }

    #[tokio::test]
    async fn params_change_updates_shared_config() {
        let core = core_with(vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Http)]);
        let params = StreamParams {
            fps: 5,
            ..StreamParams::default()
        };
        core.stream_params_changed(CameraIndex(0), StreamType::Sub, params)
            .unwrap();
        let mut status = core.subscribe_status(CameraIndex(0), StreamType::Sub).unwrap();
        status.wait_for(|s| s.config_dirty).await.unwrap();
        assert_eq!(core.cameras.len(), 1);
        assert_eq!(core.cameras[0].config.read().sub.fps, 5);
        core.shutdown().await;
    }

    #[tokio::test]
    async fn status_serializes_for_diagnostics() {
        let core = core_with(vec![CameraConfig::new(0, "10.0.0.1", CameraProtocol::Rtsp)]);
        let json = serde_json::to_value(core.cameras()).unwrap();
        assert_eq!(json[0]["streams"][0]["state"], "OFF");
        assert_eq!(json[0]["streams"][1]["stream"], "sub");
        assert_eq!(json[0]["protocol"], "rtsp");
        assert_eq!(json[0]["streams"][0]["ring"]["slot_capacity"], 1000);
        core.shutdown().await;
    }
}
