//! Stream lifecycle state machine, one per camera × stream type.
//!
//! Every input (client start/stop, adapter completions, connectivity changes,
//! configuration changes, retry timers) becomes a [`Trigger`] on the stream's
//! channel. A single actor task owns the [`StreamMachine`] and handles the
//! triggers one at a time, so the state and the request bookkeeping need no
//! lock. Adapter calls never block: completions come back later as
//! `CONTROL_CB` / `MEDIA_CB` triggers tagged with the request id, and replies
//! for ids the machine no longer tracks are dropped.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{
    AdapterStatus, CameraEvents, MediaEvent, Operation, ProtocolAdapter, ReplyPayload, ReplyTx,
    Request, RequestId,
};
use crate::config::{CameraProtocol, RetryConfig, SharedCameraConfig};
use crate::error::{AdapterError, CoreError, ErrorKind};
use crate::onvif::OnvifDiscovery;
use crate::ring::FrameRing;
use crate::types::{
    CameraIndex, ClientKind, FrameInfo, FrameRead, MediaFrame, MediaKind, StreamMetrics,
    StreamParams, StreamType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Off,
    Ready,
    OnWait,
    On,
    OffWait,
    Retry,
    Restart,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Off => "OFF",
            StreamState::Ready => "READY",
            StreamState::OnWait => "ON_WAIT",
            StreamState::On => "ON",
            StreamState::OffWait => "OFF_WAIT",
            StreamState::Retry => "RETRY",
            StreamState::Restart => "RESTART",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Unreachable,
    Shutdown,
}

/// Notifications delivered to registered clients
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Frames are flowing; poll `next_frame`
    Started,
    FrameAvailable,
    Retrying { attempt: u32 },
    /// Media stopped; the client stays registered and gets `Started` again on recovery
    Closed { reason: CloseReason },
    /// The client was dropped from the stream
    Failed { kind: ErrorKind },
}

pub type ClientCallback = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Asks the connectivity monitor to re-probe a camera from scratch
pub type ProbeReset = Arc<dyn Fn(CameraIndex) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Reachable,
    Unreachable,
    /// Turned off in configuration
    Disabled,
    Enabled,
}

pub enum Trigger {
    StartStream {
        client: ClientKind,
        callback: ClientCallback,
        respond: Option<oneshot::Sender<Result<(), CoreError>>>,
    },
    StopStream {
        client: ClientKind,
    },
    ControlCb {
        request: RequestId,
        status: AdapterStatus,
        payload: ReplyPayload,
    },
    MediaCb {
        request: RequestId,
        event: MediaEvent,
    },
    /// Stream parameters in the shared camera config changed
    ConfigChange,
    Connectivity(LinkState),
    TimerCb {
        generation: u64,
    },
    Shutdown,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::StartStream { .. } => "START_STREAM",
            Trigger::StopStream { .. } => "STOP_STREAM",
            Trigger::ControlCb { .. } => "CONTROL_CB",
            Trigger::MediaCb { .. } => "MEDIA_CB",
            Trigger::ConfigChange => "CONFIG_CHANGE",
            Trigger::Connectivity(_) => "CONNECTIVITY",
            Trigger::TimerCb { .. } => "TIMER_CB",
            Trigger::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::StartStream { client, .. } => {
                f.debug_struct("StartStream").field("client", client).finish()
            }
            Trigger::StopStream { client } => {
                f.debug_struct("StopStream").field("client", client).finish()
            }
            Trigger::ControlCb {
                request, status, ..
            } => f
                .debug_struct("ControlCb")
                .field("request", request)
                .field("status", status)
                .finish(),
            Trigger::MediaCb { request, event } => {
                let event = match event {
                    MediaEvent::Ack(status) => format!("Ack({:?})", status),
                    MediaEvent::Frame(frame) => format!("Frame({} bytes)", frame.data.len()),
                    MediaEvent::Closed => "Closed".to_string(),
                };
                f.debug_struct("MediaCb")
                    .field("request", request)
                    .field("event", &event)
                    .finish()
            }
            Trigger::ConfigChange => f.write_str("ConfigChange"),
            Trigger::Connectivity(link) => f.debug_tuple("Connectivity").field(link).finish(),
            Trigger::TimerCb { generation } => {
                f.debug_struct("TimerCb").field("generation", generation).finish()
            }
            Trigger::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// One backoff policy for every retried sequence (config, media, ONVIF discovery)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub notify_cap: u32,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            notify_cap: config.notify_cap.max(1),
            jitter: config.jitter.clamp(0.0, 0.9),
        }
    }

    /// Delay before the `step`-th consecutive retry (0-based)
    pub fn delay(&self, step: u32) -> Duration {
        let factor = 1u32 << step.min(16);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.jitter > 0.0 {
            let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            delay.mul_f64(scale)
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub camera: CameraIndex,
    pub stream: StreamType,
    pub state: StreamState,
    pub reachable: bool,
    pub disabled: bool,
    pub clients: Vec<ClientKind>,
    pub retry_attempt: u32,
    pub config_dirty: bool,
    pub metrics: StreamMetrics,
    pub last_trigger: Option<&'static str>,
    pub since: DateTime<Utc>,
}

/// Everything a stream machine needs from the rest of the core
#[derive(Clone)]
pub struct StreamDeps {
    pub config: SharedCameraConfig,
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub events: Arc<dyn CameraEvents>,
    pub discovery: Arc<OnvifDiscovery>,
    pub ring: Arc<FrameRing>,
    pub retry: RetryPolicy,
    pub off_wait_limit: u32,
    pub probe_reset: Option<ProbeReset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryTarget {
    Config,
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterTeardown {
    Idle,
    Reconfigure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlPurpose {
    Config,
    Teardown(AfterTeardown),
}

/// Ordered protocol sub-requests sharing one request id
#[derive(Debug)]
struct Sequence {
    id: RequestId,
    current: Option<Operation>,
    remaining: VecDeque<Operation>,
}

impl Sequence {
    fn new(operations: impl IntoIterator<Item = Operation>) -> Self {
        let mut remaining: VecDeque<Operation> = operations.into_iter().collect();
        let current = remaining.pop_front();
        Self {
            id: RequestId::next(),
            current,
            remaining,
        }
    }

    fn advance(&mut self) -> Option<Operation> {
        self.current = self.remaining.pop_front();
        self.current.clone()
    }

    fn is_done(&self) -> bool {
        self.current.is_none()
    }
}

struct Control {
    purpose: ControlPurpose,
    seq: Sequence,
}

struct ClientEntry {
    callback: ClientCallback,
    started: bool,
}

#[derive(Debug, Default)]
struct RateTracker {
    window_start_ms: Option<i64>,
    window_frames: u32,
    frames_since_iframe: u32,
}

pub struct StreamMachine {
    camera: CameraIndex,
    stream: StreamType,
    deps: StreamDeps,
    tx: mpsc::UnboundedSender<Trigger>,
    status_tx: watch::Sender<StreamStatus>,

    state: StreamState,
    since: DateTime<Utc>,
    last_trigger: Option<&'static str>,
    reachable: bool,
    disabled: bool,
    clients: HashMap<ClientKind, ClientEntry>,
    control: Option<Control>,
    media: Option<Sequence>,
    config_dirty: bool,

    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    retry_target: RetryTarget,
    backoff_step: u32,
    retry_attempt: u32,
    off_wait_unhandled: u32,

    metrics: StreamMetrics,
    rate: RateTracker,
}

impl StreamMachine {
    pub fn new(
        camera: CameraIndex,
        stream: StreamType,
        deps: StreamDeps,
    ) -> (Self, mpsc::UnboundedReceiver<Trigger>, watch::Receiver<StreamStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let disabled = !deps.config.read().enabled;
        let since = Utc::now();
        let initial = StreamStatus {
            camera,
            stream,
            state: StreamState::Off,
            reachable: false,
            disabled,
            clients: Vec::new(),
            retry_attempt: 0,
            config_dirty: false,
            metrics: StreamMetrics::default(),
            last_trigger: None,
            since,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let machine = Self {
            camera,
            stream,
            deps,
            tx,
            status_tx,
            state: StreamState::Off,
            since,
            last_trigger: None,
            reachable: false,
            disabled,
            clients: HashMap::new(),
            control: None,
            media: None,
            config_dirty: false,
            timer: None,
            timer_generation: 0,
            retry_target: RetryTarget::Config,
            backoff_step: 0,
            retry_attempt: 0,
            off_wait_unhandled: 0,
            metrics: StreamMetrics::default(),
            rate: RateTracker::default(),
        };
        (machine, rx, status_rx)
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Trigger> {
        self.tx.clone()
    }

    /// Process one trigger. Returns `false` once the machine has shut down.
    pub fn handle(&mut self, trigger: Trigger) -> bool {
        let name = trigger.name();

        if self.state == StreamState::OffWait && self.counts_in_off_wait(&trigger) {
            self.off_wait_unhandled += 1;
            debug!(
                camera = %self.camera,
                stream = ?self.stream,
                "{} while OFF_WAIT ({}/{})",
                name,
                self.off_wait_unhandled,
                self.deps.off_wait_limit
            );
        }

        let keep_running = match trigger {
            Trigger::StartStream {
                client,
                callback,
                respond,
            } => {
                let result = self.on_start(client, callback, name);
                self.publish();
                if let Some(respond) = respond {
                    let _ = respond.send(result);
                }
                true
            }
            Trigger::StopStream { client } => {
                self.on_stop(client, name);
                true
            }
            Trigger::ControlCb {
                request,
                status,
                payload,
            } => {
                self.on_control(request, status, payload, name);
                true
            }
            Trigger::MediaCb { request, event } => {
                self.on_media(request, event, name);
                true
            }
            Trigger::ConfigChange => {
                self.on_config_change(name);
                true
            }
            Trigger::Connectivity(link) => {
                self.on_link(link, name);
                true
            }
            Trigger::TimerCb { generation } => {
                self.on_timer(generation, name);
                true
            }
            Trigger::Shutdown => {
                self.go_off(Some(CloseReason::Shutdown), name);
                self.clients.clear();
                false
            }
        };

        if self.state == StreamState::OffWait
            && self.off_wait_unhandled > self.deps.off_wait_limit
        {
            self.force_teardown();
        }

        self.publish();
        keep_running
    }

    fn counts_in_off_wait(&self, trigger: &Trigger) -> bool {
        match trigger {
            Trigger::StartStream { .. } | Trigger::Connectivity(_) | Trigger::Shutdown => false,
            Trigger::ControlCb { request, .. } => {
                self.control.as_ref().map(|c| c.seq.id) != Some(*request)
            }
            // late frames from the channel being torn down are expected noise
            Trigger::MediaCb { .. } => false,
            Trigger::StopStream { .. } | Trigger::ConfigChange | Trigger::TimerCb { .. } => true,
        }
    }

    fn on_start(
        &mut self,
        client: ClientKind,
        callback: ClientCallback,
        trigger: &'static str,
    ) -> Result<(), CoreError> {
        if self.disabled {
            return Err(CoreError::ChannelDisabled(self.camera));
        }

        let started = self.state == StreamState::On;
        self.clients.insert(
            client,
            ClientEntry {
                callback: callback.clone(),
                started,
            },
        );
        self.deps.ring.register_cursor(client);
        info!(camera = %self.camera, stream = ?self.stream, ?client, "➕ client registered in {}", self.state);

        match self.state {
            StreamState::On => callback(ClientEvent::Started),
            StreamState::Ready => {
                if let Err(e) = self.start_media(trigger) {
                    self.drop_client(client);
                    return Err(e.into());
                }
            }
            StreamState::Retry if self.retry_target == RetryTarget::Media => {
                if let Err(e) = self.start_media(trigger) {
                    self.drop_client(client);
                    self.reject_waiting(e.kind());
                    return Err(e.into());
                }
            }
            StreamState::Off if self.reachable && self.control.is_none() => {
                self.begin_config(trigger)
            }
            // media starts once the stream is configured or torn down
            _ => {}
        }
        Ok(())
    }

    fn on_stop(&mut self, client: ClientKind, trigger: &'static str) {
        if self.clients.remove(&client).is_none() {
            debug!(camera = %self.camera, stream = ?self.stream, ?client, "stop for unregistered client");
            return;
        }
        self.deps.ring.remove_cursor(client);
        info!(camera = %self.camera, stream = ?self.stream, ?client, "➖ client left, {} remaining", self.clients.len());

        if !self.clients.is_empty() {
            return;
        }
        match self.state {
            StreamState::OnWait | StreamState::On => {
                self.begin_teardown(AfterTeardown::Idle, trigger)
            }
            StreamState::Retry if self.retry_target == RetryTarget::Media => {
                self.cancel_timer();
                self.transition(StreamState::Ready, trigger);
            }
            _ => {}
        }
    }

    fn on_control(
        &mut self,
        request: RequestId,
        status: AdapterStatus,
        payload: ReplyPayload,
        trigger: &'static str,
    ) {
        let matches = self.control.as_ref().map(|c| c.seq.id) == Some(request);
        if !matches {
            debug!(camera = %self.camera, stream = ?self.stream, %request, "stale control completion ignored");
            return;
        }
        let Some(control) = self.control.take() else {
            return;
        };

        match control.purpose {
            ControlPurpose::Teardown(after) => {
                if !status.is_ok() {
                    warn!(camera = %self.camera, stream = ?self.stream, ?status, "teardown completed with error");
                }
                self.finish_teardown(after, trigger);
            }
            ControlPurpose::Config => self.on_config_step(control.seq, status, payload, trigger),
        }
    }

    fn on_config_step(
        &mut self,
        mut seq: Sequence,
        status: AdapterStatus,
        payload: ReplyPayload,
        trigger: &'static str,
    ) {
        let step = seq.current.as_ref().map(Operation::name).unwrap_or("none");
        if let Some(kind) = status.failure_kind() {
            warn!(camera = %self.camera, stream = ?self.stream, ?status, "config step {} failed", step);
            self.on_failure(kind, RetryTarget::Config, trigger);
            return;
        }

        let understood = match seq.current.as_ref() {
            Some(
                op @ (Operation::OnvifEntryPoint
                | Operation::OnvifBrandModel
                | Operation::OnvifCapabilities),
            ) => self.deps.discovery.apply(op, &payload),
            Some(Operation::FetchStreamConfig) => {
                if let ReplyPayload::StreamConfig(reported) = &payload {
                    self.metrics.configured_fps = reported.fps;
                    let desired = self.desired_params();
                    if *reported != desired && !self.config_dirty {
                        debug!(camera = %self.camera, stream = ?self.stream, "camera config differs, pushing ours");
                        self.config_dirty = true;
                        seq.remaining.push_back(Operation::PushStreamConfig(desired));
                    }
                }
                true
            }
            Some(Operation::PushStreamConfig(params)) => {
                self.metrics.configured_fps = params.fps;
                true
            }
            _ => true,
        };
        if !understood {
            warn!(camera = %self.camera, stream = ?self.stream, "unexpected payload for {}", step);
            self.on_failure(ErrorKind::Capability, RetryTarget::Config, trigger);
            return;
        }

        match seq.advance() {
            Some(next) => {
                let id = seq.id;
                self.control = Some(Control {
                    purpose: ControlPurpose::Config,
                    seq,
                });
                if let Err(e) = self.send(id, next) {
                    self.control = None;
                    self.on_failure(e.kind(), RetryTarget::Config, trigger);
                }
            }
            None => {
                self.config_dirty = false;
                self.backoff_step = 0;
                self.retry_attempt = 0;
                self.transition(StreamState::Ready, trigger);
                self.resume_clients(trigger);
            }
        }
    }

    fn on_media(&mut self, request: RequestId, event: MediaEvent, trigger: &'static str) {
        let matches = self.media.as_ref().map(|m| m.id) == Some(request);
        if !matches {
            if !matches!(event, MediaEvent::Frame(_)) {
                debug!(camera = %self.camera, stream = ?self.stream, %request, "stale media event ignored");
            }
            return;
        }

        match event {
            MediaEvent::Ack(status) => self.on_media_ack(status, trigger),
            MediaEvent::Frame(frame) => self.on_frame(frame, trigger),
            MediaEvent::Closed => {
                self.media = None;
                warn!(camera = %self.camera, stream = ?self.stream, "media channel closed in {}", self.state);
                if !matches!(self.state, StreamState::OnWait | StreamState::On) {
                    return;
                }
                if self.clients.is_empty() {
                    self.begin_teardown(AfterTeardown::Idle, trigger);
                } else {
                    for entry in self.clients.values_mut() {
                        entry.started = false;
                    }
                    self.schedule_retry(RetryTarget::Media, trigger);
                }
            }
        }
    }

    fn on_media_ack(&mut self, status: AdapterStatus, trigger: &'static str) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        if media.is_done() {
            debug!(camera = %self.camera, stream = ?self.stream, "ack after negotiation finished");
            return;
        }
        let step = media.current.as_ref().map(Operation::name).unwrap_or("none");

        if let Some(kind) = status.failure_kind() {
            warn!(camera = %self.camera, stream = ?self.stream, ?status, "media step {} failed", step);
            if let Some(media) = self.media.take() {
                self.deps.adapter.cancel(media.id);
            }
            self.on_failure(kind, RetryTarget::Media, trigger);
            return;
        }

        let id = media.id;
        match media.advance() {
            Some(next) => {
                if let Err(e) = self.send(id, next) {
                    self.media = None;
                    self.on_failure(e.kind(), RetryTarget::Media, trigger);
                }
            }
            None => debug!(camera = %self.camera, stream = ?self.stream, "media negotiated, waiting for data"),
        }
    }

    fn on_frame(&mut self, frame: MediaFrame, trigger: &'static str) {
        let now_ms = Utc::now().timestamp_millis();
        match self.deps.ring.write(&frame, now_ms) {
            Ok(info) => self.record_frame(&info, now_ms),
            Err(e) => {
                warn!(camera = %self.camera, stream = ?self.stream, "frame dropped: {}", e);
                return;
            }
        }

        let negotiated = self.media.as_ref().map_or(false, Sequence::is_done);
        if self.state == StreamState::OnWait && negotiated {
            self.backoff_step = 0;
            self.retry_attempt = 0;
            self.transition(StreamState::On, trigger);
            for entry in self.clients.values_mut() {
                if !entry.started {
                    entry.started = true;
                    (entry.callback)(ClientEvent::Started);
                }
            }
        }

        if self.state == StreamState::On {
            for entry in self.clients.values().filter(|e| e.started) {
                (entry.callback)(ClientEvent::FrameAvailable);
            }
        }
    }

    fn on_config_change(&mut self, trigger: &'static str) {
        self.config_dirty = true;
        match self.state {
            StreamState::On | StreamState::OnWait => {
                self.begin_teardown(AfterTeardown::Reconfigure, trigger)
            }
            StreamState::Ready => self.reconfigure(trigger),
            StreamState::Retry if self.retry_target == RetryTarget::Media => {
                self.cancel_timer();
                self.reconfigure(trigger);
            }
            // a config sequence in flight read the old parameters; start over
            StreamState::Off | StreamState::Retry if self.control.is_some() => {
                self.begin_config(trigger)
            }
            // picked up by the pending config attempt or after teardown
            _ => {}
        }
    }

    fn on_link(&mut self, link: LinkState, trigger: &'static str) {
        match link {
            LinkState::Reachable => {
                self.reachable = true;
                if self.state == StreamState::Off && !self.disabled && self.control.is_none() {
                    self.begin_config(trigger);
                }
            }
            LinkState::Unreachable => {
                self.reachable = false;
                self.deps.events.mark_inactive(self.camera);
                let notify = (self.state != StreamState::Off).then_some(CloseReason::Unreachable);
                self.go_off(notify, trigger);
            }
            LinkState::Disabled => {
                self.disabled = true;
                self.go_off(None, trigger);
            }
            LinkState::Enabled => {
                self.disabled = false;
                if self.reachable && self.state == StreamState::Off && self.control.is_none() {
                    self.begin_config(trigger);
                }
            }
        }
    }

    fn on_timer(&mut self, generation: u64, trigger: &'static str) {
        if generation != self.timer_generation || self.state != StreamState::Retry {
            debug!(camera = %self.camera, stream = ?self.stream, generation, "stale retry timer");
            return;
        }
        self.timer = None;
        self.retry_attempt = (self.retry_attempt + 1).min(self.deps.retry.notify_cap);
        let attempt = self.retry_attempt;
        for entry in self.clients.values() {
            (entry.callback)(ClientEvent::Retrying { attempt });
        }

        if !self.reachable || self.disabled {
            self.transition(StreamState::Off, trigger);
            return;
        }
        info!(camera = %self.camera, stream = ?self.stream, "🔁 retry attempt {} ({:?})", attempt, self.retry_target);
        match self.retry_target {
            RetryTarget::Config => self.begin_config(trigger),
            RetryTarget::Media if self.clients.is_empty() => {
                self.transition(StreamState::Ready, trigger)
            }
            RetryTarget::Media => {
                self.transition(StreamState::Ready, trigger);
                self.resume_clients(trigger);
            }
        }
    }

    fn begin_config(&mut self, trigger: &'static str) {
        if let Some(old) = self.control.take() {
            self.deps.adapter.cancel(old.seq.id);
        }

        let mut operations = Vec::new();
        if self.protocol() == CameraProtocol::Onvif && !self.deps.discovery.is_complete() {
            operations.extend(self.deps.discovery.pending_steps());
        }
        operations.push(Operation::FetchStreamConfig);
        if self.config_dirty {
            operations.push(Operation::PushStreamConfig(self.desired_params()));
        }

        let seq = Sequence::new(operations);
        let id = seq.id;
        let Some(first) = seq.current.clone() else {
            return;
        };
        debug!(camera = %self.camera, stream = ?self.stream, %id, "configuring ({} steps)", seq.remaining.len() + 1);
        self.control = Some(Control {
            purpose: ControlPurpose::Config,
            seq,
        });
        if let Err(e) = self.send(id, first) {
            self.control = None;
            self.on_failure(e.kind(), RetryTarget::Config, trigger);
        }
    }

    fn reconfigure(&mut self, trigger: &'static str) {
        self.deps.ring.clear();
        self.transition(StreamState::Off, trigger);
        if self.reachable && !self.disabled {
            self.begin_config(trigger);
        }
    }

    /// Open the media channel. Only a resource-limit refusal is returned;
    /// other refusals are folded into a retry.
    fn start_media(&mut self, trigger: &'static str) -> Result<(), AdapterError> {
        self.cancel_timer();
        let operations = match self.protocol() {
            CameraProtocol::Rtsp | CameraProtocol::Onvif => {
                vec![Operation::Describe, Operation::Setup, Operation::Play]
            }
            CameraProtocol::Http | CameraProtocol::Tcp => vec![Operation::OpenMedia],
        };
        let seq = Sequence::new(operations);
        let id = seq.id;
        let Some(first) = seq.current.clone() else {
            return Ok(());
        };
        self.media = Some(seq);
        self.transition(StreamState::OnWait, trigger);

        match self.send(id, first) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ResourceLimit => {
                self.media = None;
                warn!(camera = %self.camera, stream = ?self.stream, "media refused: {}", e);
                self.transition(StreamState::Ready, trigger);
                Err(e)
            }
            Err(e) => {
                self.media = None;
                self.on_failure(e.kind(), RetryTarget::Media, trigger);
                Ok(())
            }
        }
    }

    fn resume_clients(&mut self, trigger: &'static str) {
        if self.clients.is_empty() {
            return;
        }
        if let Err(e) = self.start_media(trigger) {
            self.reject_waiting(e.kind());
        }
    }

    fn begin_teardown(&mut self, after: AfterTeardown, trigger: &'static str) {
        self.cancel_timer();
        self.media = None;
        if let Some(old) = self.control.take() {
            self.deps.adapter.cancel(old.seq.id);
        }

        let seq = Sequence::new([Operation::StopMedia]);
        let id = seq.id;
        self.control = Some(Control {
            purpose: ControlPurpose::Teardown(after),
            seq,
        });
        self.off_wait_unhandled = 0;
        let next = match after {
            AfterTeardown::Idle => StreamState::OffWait,
            AfterTeardown::Reconfigure => StreamState::Restart,
        };
        self.transition(next, trigger);

        if let Err(e) = self.send(id, Operation::StopMedia) {
            warn!(camera = %self.camera, stream = ?self.stream, "teardown refused: {}", e);
            self.control = None;
            self.finish_teardown(after, trigger);
        }
    }

    fn finish_teardown(&mut self, after: AfterTeardown, trigger: &'static str) {
        for entry in self.clients.values_mut() {
            entry.started = false;
        }
        if !self.reachable || self.disabled {
            self.go_off(None, trigger);
            return;
        }
        if after == AfterTeardown::Reconfigure || self.config_dirty {
            self.reconfigure(trigger);
            return;
        }
        self.transition(StreamState::Ready, trigger);
        self.resume_clients(trigger);
    }

    fn force_teardown(&mut self) {
        warn!(
            camera = %self.camera,
            stream = ?self.stream,
            "teardown not confirmed after {} triggers, forcing reset",
            self.off_wait_unhandled
        );
        if let Some(control) = self.control.take() {
            self.deps.adapter.cancel(control.seq.id);
        }
        self.off_wait_unhandled = 0;
        self.finish_teardown(AfterTeardown::Idle, "OFF_WAIT_LIMIT");
    }

    fn on_failure(&mut self, kind: ErrorKind, target: RetryTarget, trigger: &'static str) {
        match kind {
            ErrorKind::ChannelDisabled => {
                // stays refused until the camera is enabled again
                info!(camera = %self.camera, stream = ?self.stream, "channel disabled by camera");
                self.disabled = true;
                self.go_off(None, trigger);
            }
            ErrorKind::Disconnected => {
                self.reachable = false;
                self.deps.events.mark_inactive(self.camera);
                self.go_off(Some(CloseReason::Unreachable), trigger);
                if let Some(reset) = &self.deps.probe_reset {
                    reset(self.camera);
                }
            }
            ErrorKind::ResourceLimit => {
                warn!(camera = %self.camera, stream = ?self.stream, "{:?} refused: resource limit", target);
                self.reject_waiting(kind);
                let next = match target {
                    RetryTarget::Media => StreamState::Ready,
                    // the next client start tries the configuration again
                    RetryTarget::Config => StreamState::Off,
                };
                self.transition(next, trigger);
            }
            ErrorKind::Capability => {
                self.deps.discovery.reset();
                self.schedule_retry(target, trigger);
            }
            ErrorKind::Transient => self.schedule_retry(target, trigger),
        }
    }

    fn schedule_retry(&mut self, target: RetryTarget, trigger: &'static str) {
        let delay = self.deps.retry.delay(self.backoff_step);
        self.backoff_step = self.backoff_step.saturating_add(1);
        self.retry_target = target;
        self.arm_timer(delay);
        info!(camera = %self.camera, stream = ?self.stream, "⏳ {:?} retry in {:?}", target, delay);
        self.transition(StreamState::Retry, trigger);
    }

    fn arm_timer(&mut self, delay: Duration) {
        self.cancel_timer();
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let tx = self.tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Trigger::TimerCb { generation });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // a TimerCb already queued must not match any more
        self.timer_generation += 1;
    }

    /// Cancel everything in flight and fall back to OFF
    fn go_off(&mut self, notify: Option<CloseReason>, trigger: &'static str) {
        self.cancel_timer();
        if let Some(control) = self.control.take() {
            self.deps.adapter.cancel(control.seq.id);
        }
        if let Some(media) = self.media.take() {
            self.deps.adapter.cancel(media.id);
        }
        self.backoff_step = 0;
        self.retry_attempt = 0;
        for entry in self.clients.values_mut() {
            entry.started = false;
            if let Some(reason) = notify {
                (entry.callback)(ClientEvent::Closed { reason });
            }
        }
        self.transition(StreamState::Off, trigger);
    }

    /// Drop every client still waiting for media, telling it why
    fn reject_waiting(&mut self, kind: ErrorKind) {
        let waiting: Vec<ClientKind> = self
            .clients
            .iter()
            .filter(|(_, entry)| !entry.started)
            .map(|(client, _)| *client)
            .collect();
        for client in waiting {
            if let Some(entry) = self.clients.remove(&client) {
                (entry.callback)(ClientEvent::Failed { kind });
            }
            self.deps.ring.remove_cursor(client);
        }
    }

    fn drop_client(&mut self, client: ClientKind) {
        self.clients.remove(&client);
        self.deps.ring.remove_cursor(client);
    }

    fn send(&self, id: RequestId, operation: Operation) -> Result<(), AdapterError> {
        let camera = self.deps.config.read().clone();
        let descriptor = self
            .deps
            .adapter
            .describe(&camera, Some(self.stream), operation);
        debug!(
            camera = %self.camera,
            stream = ?self.stream,
            %id,
            "📤 {} via {:?}",
            descriptor.operation.name(),
            descriptor.transport
        );
        self.deps.adapter.send_request(Request {
            id,
            descriptor,
            reply: ReplyTx::for_stream(id, self.tx.clone()),
        })
    }

    fn protocol(&self) -> CameraProtocol {
        self.deps.config.read().protocol
    }

    fn desired_params(&self) -> StreamParams {
        self.deps.config.read().params(self.stream).clone()
    }

    fn record_frame(&mut self, info: &FrameInfo, now_ms: i64) {
        self.metrics.frames_received += 1;
        if info.kind != MediaKind::Video {
            return;
        }
        self.metrics.codec = info.codec;
        self.metrics.resolution = info.resolution;

        self.rate.frames_since_iframe += 1;
        if info.is_iframe {
            if self.rate.frames_since_iframe > 1 {
                self.metrics.gop_length = self.rate.frames_since_iframe - 1;
            }
            self.rate.frames_since_iframe = 1;
        }

        let start = *self.rate.window_start_ms.get_or_insert(now_ms);
        self.rate.window_frames += 1;
        let elapsed = now_ms - start;
        if elapsed >= 1000 {
            self.metrics.fps = self.rate.window_frames as f64 * 1000.0 / elapsed as f64;
            self.rate.window_start_ms = Some(now_ms);
            self.rate.window_frames = 0;
        }
    }

    fn transition(&mut self, next: StreamState, trigger: &'static str) {
        let previous = self.state;
        self.state = next;
        self.last_trigger = Some(trigger);
        if previous != next {
            self.since = Utc::now();
            info!(
                camera = %self.camera,
                stream = ?self.stream,
                "🔄 {} -> {} on {}",
                previous,
                next,
                trigger
            );
        }
    }

    fn publish(&self) {
        let mut clients: Vec<ClientKind> = self.clients.keys().copied().collect();
        clients.sort_by_key(|c| *c as u8);
        self.status_tx.send_replace(StreamStatus {
            camera: self.camera,
            stream: self.stream,
            state: self.state,
            reachable: self.reachable,
            disabled: self.disabled,
            clients,
            retry_attempt: self.retry_attempt,
            config_dirty: self.config_dirty,
            metrics: self.metrics.clone(),
            last_trigger: self.last_trigger,
            since: self.since,
        });
    }
}

#[instrument(skip_all, fields(camera = %machine.camera, stream = ?machine.stream))]
async fn run_machine(mut machine: StreamMachine, mut rx: mpsc::UnboundedReceiver<Trigger>) {
    debug!("🎬 stream actor started");
    while let Some(trigger) = rx.recv().await {
        if !machine.handle(trigger) {
            break;
        }
    }
    debug!("🛑 stream actor stopped");
}

/// Cheap handle to a running stream actor
#[derive(Clone)]
pub struct StreamHandle {
    camera: CameraIndex,
    stream: StreamType,
    tx: mpsc::UnboundedSender<Trigger>,
    status: watch::Receiver<StreamStatus>,
    ring: Arc<FrameRing>,
}

impl StreamHandle {
    pub fn spawn(camera: CameraIndex, stream: StreamType, deps: StreamDeps) -> (Self, JoinHandle<()>) {
        let ring = deps.ring.clone();
        let (machine, rx, status) = StreamMachine::new(camera, stream, deps);
        let tx = machine.sender();
        let task = tokio::spawn(run_machine(machine, rx));
        (
            Self {
                camera,
                stream,
                tx,
                status,
                ring,
            },
            task,
        )
    }

    pub fn send(&self, trigger: Trigger) -> Result<(), CoreError> {
        self.tx.send(trigger).map_err(|_| CoreError::StreamShutDown {
            camera: self.camera,
            stream: self.stream,
        })
    }

    /// Register a client; resolves once the stream accepted or refused it
    pub async fn start(&self, client: ClientKind, callback: ClientCallback) -> Result<(), CoreError> {
        let (respond, answer) = oneshot::channel();
        self.send(Trigger::StartStream {
            client,
            callback,
            respond: Some(respond),
        })?;
        answer.await.map_err(|_| CoreError::StreamShutDown {
            camera: self.camera,
            stream: self.stream,
        })?
    }

    pub fn stop(&self, client: ClientKind) -> Result<(), CoreError> {
        self.send(Trigger::StopStream { client })
    }

    pub fn next_frame(&self, client: ClientKind) -> Result<Option<FrameRead>, CoreError> {
        if !self.status.borrow().clients.contains(&client) {
            return Err(CoreError::UnknownClient(client));
        }
        Ok(self.ring.read(client))
    }

    pub fn status(&self) -> StreamStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }
}
