//! PTZ command queue and worker, one per camera.
//!
//! Clients enqueue synchronously and get an immediate [`PtzOutcome`]. A worker
//! task is spawned on the first accepted command and retires once the queue is
//! empty; while it runs, only the session that started it may enqueue.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{AdapterStatus, Operation, ProtocolAdapter, ReplyTx, Request, RequestId};
use crate::config::{PtzConfig, SharedCameraConfig};
use crate::error::ErrorKind;
use crate::types::CameraIndex;

/// Client session issuing PTZ commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzFunction {
    PanTiltZoom,
    Focus,
    Iris,
    Preset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PtzAction {
    Start,
    Stop,
}

/// What to move and how; velocities are signed percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzTarget {
    PanTiltZoom { pan: i8, tilt: i8, zoom: i8 },
    Focus(i8),
    Iris(i8),
    Preset(u16),
}

impl PtzTarget {
    pub fn function(&self) -> PtzFunction {
        match self {
            PtzTarget::PanTiltZoom { .. } => PtzFunction::PanTiltZoom,
            PtzTarget::Focus(_) => PtzFunction::Focus,
            PtzTarget::Iris(_) => PtzFunction::Iris,
            PtzTarget::Preset(_) => PtzFunction::Preset,
        }
    }

    /// Direction of travel, ignoring speed
    fn direction(&self) -> (i8, i8, i8) {
        match *self {
            PtzTarget::PanTiltZoom { pan, tilt, zoom } => {
                (pan.signum(), tilt.signum(), zoom.signum())
            }
            PtzTarget::Focus(v) | PtzTarget::Iris(v) => (v.signum(), 0, 0),
            PtzTarget::Preset(_) => (0, 0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PtzCommand {
    pub target: PtzTarget,
    pub action: PtzAction,
    /// 1..=100
    pub speed: u8,
}

impl PtzCommand {
    pub fn pan_tilt_zoom(pan: i8, tilt: i8, zoom: i8, speed: u8) -> Self {
        Self {
            target: PtzTarget::PanTiltZoom { pan, tilt, zoom },
            action: PtzAction::Start,
            speed,
        }
    }

    pub fn focus(direction: i8, speed: u8) -> Self {
        Self {
            target: PtzTarget::Focus(direction),
            action: PtzAction::Start,
            speed,
        }
    }

    pub fn iris(direction: i8, speed: u8) -> Self {
        Self {
            target: PtzTarget::Iris(direction),
            action: PtzAction::Start,
            speed,
        }
    }

    pub fn preset(number: u16, speed: u8) -> Self {
        Self {
            target: PtzTarget::Preset(number),
            action: PtzAction::Start,
            speed,
        }
    }

    /// Stop whatever `function` is doing
    pub fn stop(function: PtzFunction) -> Self {
        let target = match function {
            PtzFunction::PanTiltZoom => PtzTarget::PanTiltZoom {
                pan: 0,
                tilt: 0,
                zoom: 0,
            },
            PtzFunction::Focus => PtzTarget::Focus(0),
            PtzFunction::Iris => PtzTarget::Iris(0),
            PtzFunction::Preset => PtzTarget::Preset(0),
        };
        Self {
            target,
            action: PtzAction::Stop,
            speed: 0,
        }
    }

    pub fn function(&self) -> PtzFunction {
        self.target.function()
    }

    fn is_continuous_start(&self) -> bool {
        self.action == PtzAction::Start && self.function() != PtzFunction::Preset
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.action == PtzAction::Stop {
            return Ok(());
        }
        if self.speed == 0 || self.speed > 100 {
            return Err("speed out of range");
        }
        let in_range = |v: i8| (-100..=100).contains(&v);
        match self.target {
            PtzTarget::PanTiltZoom { pan, tilt, zoom } => {
                if !(in_range(pan) && in_range(tilt) && in_range(zoom)) {
                    return Err("velocity out of range");
                }
                if pan == 0 && tilt == 0 && zoom == 0 {
                    return Err("no movement requested");
                }
            }
            PtzTarget::Focus(v) | PtzTarget::Iris(v) => {
                if v == 0 || !in_range(v) {
                    return Err("direction out of range");
                }
            }
            PtzTarget::Preset(_) => {}
        }
        Ok(())
    }
}

/// Adapter completion for a PTZ request
#[derive(Debug, Clone, PartialEq)]
pub struct PtzReply {
    pub request: RequestId,
    pub status: AdapterStatus,
}

/// Synchronous answer to an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzOutcome {
    Accepted,
    /// Another session owns the running worker
    Busy,
    /// Queue at capacity
    Full,
    Rejected,
}

/// Final result delivered to the command's callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzResult {
    Completed,
    Failed(ErrorKind),
    TimedOut,
}

pub type PtzCallback = Box<dyn FnOnce(PtzResult) + Send + 'static>;

struct PtzEntry {
    session: SessionId,
    command: PtzCommand,
    callback: Option<PtzCallback>,
}

impl PtzEntry {
    fn complete(self, result: PtzResult) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PtzStats {
    pub owner: Option<SessionId>,
    pub worker_running: bool,
    pub issued: u64,
    pub synthetic_stops: u64,
    pub timeouts: u64,
    pub active: Option<PtzCommand>,
}

struct PtzInner {
    owner: Option<SessionId>,
    /// Held here while no worker runs
    rx: Option<mpsc::Receiver<PtzEntry>>,
    worker: Option<JoinHandle<()>>,
    /// Continuous motion the camera is still executing
    active: Option<PtzCommand>,
    closed: bool,
    issued: u64,
    synthetic_stops: u64,
    timeouts: u64,
}

pub struct PtzQueue {
    camera: CameraIndex,
    config: SharedCameraConfig,
    adapter: Arc<dyn ProtocolAdapter>,
    settings: PtzConfig,
    runtime: Handle,
    tx: mpsc::Sender<PtzEntry>,
    inner: Mutex<PtzInner>,
    shutdown: watch::Sender<bool>,
}

impl PtzQueue {
    pub fn new(
        camera: CameraIndex,
        config: SharedCameraConfig,
        adapter: Arc<dyn ProtocolAdapter>,
        settings: PtzConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            camera,
            config,
            adapter,
            settings,
            runtime,
            tx,
            inner: Mutex::new(PtzInner {
                owner: None,
                rx: Some(rx),
                worker: None,
                active: None,
                closed: false,
                issued: 0,
                synthetic_stops: 0,
                timeouts: 0,
            }),
            shutdown,
        })
    }

    pub fn enqueue(
        self: &Arc<Self>,
        session: SessionId,
        command: PtzCommand,
        callback: Option<PtzCallback>,
    ) -> PtzOutcome {
        {
            let camera = self.config.read();
            if !camera.enabled || !camera.ptz_supported {
                debug!(camera = %self.camera, "PTZ not available");
                return PtzOutcome::Rejected;
            }
        }
        if let Err(reason) = command.validate() {
            debug!(camera = %self.camera, ?command, "PTZ command rejected: {}", reason);
            return PtzOutcome::Rejected;
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return PtzOutcome::Rejected;
        }
        if let Some(owner) = inner.owner {
            if owner != session {
                debug!(camera = %self.camera, ?owner, ?session, "PTZ busy");
                return PtzOutcome::Busy;
            }
        }

        let entry = PtzEntry {
            session,
            command,
            callback,
        };
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(camera = %self.camera, "PTZ queue full");
                return PtzOutcome::Full;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return PtzOutcome::Rejected,
        }

        if inner.owner.is_none() {
            if let Some(rx) = inner.rx.take() {
                inner.owner = Some(session);
                let queue = Arc::clone(self);
                inner.worker = Some(self.runtime.spawn(run_worker(queue, rx)));
                info!(camera = %self.camera, ?session, "🎮 PTZ worker started");
            }
        }
        PtzOutcome::Accepted
    }

    pub fn stats(&self) -> PtzStats {
        let inner = self.inner.lock();
        PtzStats {
            owner: inner.owner,
            worker_running: inner.owner.is_some(),
            issued: inner.issued,
            synthetic_stops: inner.synthetic_stops,
            timeouts: inner.timeouts,
            active: inner.active.clone(),
        }
    }

    /// Refuse new commands, let the worker finish its current command and
    /// complete everything still queued as successful.
    pub async fn shutdown(&self) {
        let (worker, rx) = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            (inner.worker.take(), inner.rx.take())
        };
        self.shutdown.send_replace(true);

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(camera = %self.camera, "PTZ worker ended abnormally: {}", e);
            }
        }
        if let Some(mut rx) = rx.or_else(|| self.inner.lock().rx.take()) {
            drain(self.camera, &mut rx);
        }
    }

    /// Send one command and wait for the camera to confirm it
    async fn execute(
        &self,
        command: &PtzCommand,
        replies: &mut mpsc::UnboundedReceiver<PtzReply>,
        reply_tx: &mpsc::UnboundedSender<PtzReply>,
    ) -> PtzResult {
        let id = RequestId::next();
        let camera = self.config.read().clone();
        let descriptor = self
            .adapter
            .describe(&camera, None, Operation::Ptz(command.clone()));
        self.inner.lock().issued += 1;

        let request = Request {
            id,
            descriptor,
            reply: ReplyTx::for_ptz(id, reply_tx.clone()),
        };
        if let Err(e) = self.adapter.send_request(request) {
            warn!(camera = %self.camera, "PTZ request refused: {}", e);
            return PtzResult::Failed(e.kind());
        }

        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        for _ in 0..self.settings.max_polls {
            match timeout(poll, replies.recv()).await {
                Ok(Some(reply)) if reply.request == id => {
                    return match reply.status.failure_kind() {
                        None => PtzResult::Completed,
                        Some(kind) => PtzResult::Failed(kind),
                    };
                }
                Ok(Some(stale)) => debug!(camera = %self.camera, request = %stale.request, "stale PTZ reply"),
                Ok(None) => return PtzResult::Failed(ErrorKind::Transient),
                Err(_) => {}
            }
        }

        warn!(camera = %self.camera, %id, "PTZ command not confirmed, giving up");
        self.adapter.cancel(id);
        self.inner.lock().timeouts += 1;
        PtzResult::TimedOut
    }
}

fn drain(camera: CameraIndex, rx: &mut mpsc::Receiver<PtzEntry>) {
    let mut drained = 0;
    while let Ok(entry) = rx.try_recv() {
        entry.complete(PtzResult::Completed);
        drained += 1;
    }
    if drained > 0 {
        info!(%camera, "PTZ queue drained {} pending commands", drained);
    }
}

#[instrument(skip_all, fields(camera = %queue.camera))]
async fn run_worker(queue: Arc<PtzQueue>, mut rx: mpsc::Receiver<PtzEntry>) {
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let shutdown = queue.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            drain(queue.camera, &mut rx);
            queue.inner.lock().owner = None;
            debug!("PTZ worker stopped for shutdown");
            return;
        }

        let entry = match rx.try_recv() {
            Ok(entry) => entry,
            Err(_) => {
                // check again under the lock so an enqueue cannot slip in unseen
                let mut inner = queue.inner.lock();
                match rx.try_recv() {
                    Ok(entry) => entry,
                    Err(_) => {
                        inner.owner = None;
                        inner.worker = None;
                        inner.rx = Some(rx);
                        info!("💤 PTZ worker idle, retiring");
                        return;
                    }
                }
            }
        };

        let previous = queue.inner.lock().active.clone();
        if let Some(previous) = previous {
            let changes_course = entry.command.action == PtzAction::Start
                && (previous.function() != entry.command.function()
                    || previous.target.direction() != entry.command.target.direction());
            if changes_course {
                let stop = PtzCommand::stop(previous.function());
                debug!(session = ?entry.session, "stopping {:?} before new command", previous.target);
                queue.inner.lock().synthetic_stops += 1;
                let result = queue.execute(&stop, &mut replies, &reply_tx).await;
                if result != PtzResult::Completed {
                    warn!("synthetic PTZ stop ended with {:?}", result);
                }
                queue.inner.lock().active = None;
            }
        }

        let result = queue.execute(&entry.command, &mut replies, &reply_tx).await;
        {
            let mut inner = queue.inner.lock();
            if entry.command.is_continuous_start() {
                inner.active = Some(entry.command.clone());
            } else if entry.command.action == PtzAction::Stop
                && inner.active.as_ref().map(PtzCommand::function) == Some(entry.command.function())
            {
                inner.active = None;
            }
        }
        debug!(session = ?entry.session, "PTZ {:?} -> {:?}", entry.command.target, result);
        entry.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, CameraProtocol};
    use crate::error::AdapterError;
    use parking_lot::RwLock;

    #[derive(Default)]
    struct PtzRecorder {
        commands: Mutex<Vec<PtzCommand>>,
        cancelled: Mutex<Vec<RequestId>>,
        silent: bool,
    }

    impl ProtocolAdapter for PtzRecorder {
        fn send_request(&self, request: Request) -> Result<(), AdapterError> {
            let Operation::Ptz(command) = request.descriptor.operation.clone() else {
                return Err(AdapterError::Capability("not ptz".into()));
            };
            self.commands.lock().push(command);
            if !self.silent {
                request.reply.control(AdapterStatus::Ok, Default::default());
            }
            Ok(())
        }

        fn cancel(&self, request: RequestId) {
            self.cancelled.lock().push(request);
        }
    }

    fn queue_with(adapter: Arc<PtzRecorder>, capacity: usize) -> Arc<PtzQueue> {
        let mut camera = CameraConfig::new(1, "10.0.0.1", CameraProtocol::Onvif);
        camera.ptz_supported = true;
        PtzQueue::new(
            CameraIndex(1),
            Arc::new(RwLock::new(camera)),
            adapter,
            PtzConfig {
                queue_capacity: capacity,
                poll_interval_ms: 200,
                max_polls: 10,
            },
            Handle::current(),
        )
    }

    type Results = Arc<Mutex<Vec<PtzResult>>>;

    fn recorder(results: &Results) -> Option<PtzCallback> {
        let results = results.clone();
        Some(Box::new(move |r| results.lock().push(r)))
    }

    async fn idle(queue: &PtzQueue) {
        while queue.stats().worker_running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn direction_change_issues_exactly_one_stop() {
        let adapter = Arc::new(PtzRecorder::default());
        let queue = queue_with(adapter.clone(), 8);
        let session = SessionId(1);

        let right = PtzCommand::pan_tilt_zoom(50, 0, 0, 40);
        let left = PtzCommand::pan_tilt_zoom(-50, 0, 0, 40);
        assert_eq!(queue.enqueue(session, right.clone(), None), PtzOutcome::Accepted);
        assert_eq!(queue.enqueue(session, left.clone(), None), PtzOutcome::Accepted);
        idle(&queue).await;

        assert_eq!(
            *adapter.commands.lock(),
            vec![right, PtzCommand::stop(PtzFunction::PanTiltZoom), left.clone()]
        );
        assert_eq!(queue.stats().synthetic_stops, 1);
        assert_eq!(queue.stats().active, Some(left));
    }

    #[tokio::test(start_paused = true)]
    async fn speed_change_and_explicit_stop_need_no_synthetic_stop() {
        let adapter = Arc::new(PtzRecorder::default());
        let queue = queue_with(adapter.clone(), 8);
        let session = SessionId(4);

        queue.enqueue(session, PtzCommand::pan_tilt_zoom(0, 30, 0, 20), None);
        queue.enqueue(session, PtzCommand::pan_tilt_zoom(0, 80, 0, 90), None);
        queue.enqueue(session, PtzCommand::stop(PtzFunction::PanTiltZoom), None);
        queue.enqueue(session, PtzCommand::focus(-1, 10), None);
        idle(&queue).await;

        assert_eq!(adapter.commands.lock().len(), 4);
        assert_eq!(queue.stats().synthetic_stops, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn function_switch_stops_previous_motion() {
        let adapter = Arc::new(PtzRecorder::default());
        let queue = queue_with(adapter.clone(), 8);
        let session = SessionId(2);

        queue.enqueue(session, PtzCommand::focus(1, 50), None);
        idle(&queue).await;
        // motion survives the worker retiring
        queue.enqueue(session, PtzCommand::iris(1, 50), None);
        idle(&queue).await;

        let commands = adapter.commands.lock();
        assert_eq!(commands[1], PtzCommand::stop(PtzFunction::Focus));
        assert_eq!(commands.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_reports_full_at_capacity() {
        let adapter = Arc::new(PtzRecorder {
            silent: true,
            ..Default::default()
        });
        let queue = queue_with(adapter, 2);
        let session = SessionId(1);

        assert_eq!(queue.enqueue(session, PtzCommand::preset(1, 50), None), PtzOutcome::Accepted);
        assert_eq!(queue.enqueue(session, PtzCommand::preset(2, 50), None), PtzOutcome::Accepted);
        for _ in 0..3 {
            assert_eq!(queue.enqueue(session, PtzCommand::preset(3, 50), None), PtzOutcome::Full);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn other_session_is_busy_until_worker_retires() {
        let adapter = Arc::new(PtzRecorder::default());
        let queue = queue_with(adapter, 4);

        assert_eq!(
            queue.enqueue(SessionId(1), PtzCommand::preset(1, 10), None),
            PtzOutcome::Accepted
        );
        assert_eq!(
            queue.enqueue(SessionId(2), PtzCommand::preset(2, 10), None),
            PtzOutcome::Busy
        );
        assert_eq!(
            queue.enqueue(SessionId(1), PtzCommand::preset(3, 10), None),
            PtzOutcome::Accepted
        );
        idle(&queue).await;
        assert_eq!(
            queue.enqueue(SessionId(2), PtzCommand::preset(2, 10), None),
            PtzOutcome::Accepted
        );
        assert_eq!(queue.stats().owner, Some(SessionId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_times_out_after_max_polls() {
        let adapter = Arc::new(PtzRecorder {
            silent: true,
            ..Default::default()
        });
        let queue = queue_with(adapter.clone(), 4);
        let results = Results::default();

        let started = tokio::time::Instant::now();
        queue.enqueue(SessionId(1), PtzCommand::preset(7, 50), recorder(&results));
        idle(&queue).await;

        assert_eq!(*results.lock(), vec![PtzResult::TimedOut]);
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(adapter.cancelled.lock().len(), 1);
        assert_eq!(queue.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn invalid_or_unsupported_commands_are_rejected() {
        let adapter = Arc::new(PtzRecorder::default());
        let queue = queue_with(adapter, 4);
        let session = SessionId(1);

        assert_eq!(
            queue.enqueue(session, PtzCommand::pan_tilt_zoom(0, 0, 0, 10), None),
            PtzOutcome::Rejected
        );
        assert_eq!(queue.enqueue(session, PtzCommand::focus(1, 0), None), PtzOutcome::Rejected);
        assert_eq!(
            queue.enqueue(session, PtzCommand::pan_tilt_zoom(120, 0, 0, 10), None),
            PtzOutcome::Rejected
        );

        queue.config.write().ptz_supported = false;
        assert_eq!(queue.enqueue(session, PtzCommand::focus(1, 10), None), PtzOutcome::Rejected);
        assert!(!queue.stats().worker_running);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queue_with_success() {
        let adapter = Arc::new(PtzRecorder {
            silent: true,
            ..Default::default()
        });
        let queue = queue_with(adapter.clone(), 4);
        let results = Results::default();
        for preset in 1..=3 {
            queue.enqueue(SessionId(1), PtzCommand::preset(preset, 50), recorder(&results));
        }
        // let the worker pick up the first command
        tokio::task::yield_now().await;

        queue.shutdown().await;
        assert_eq!(
            *results.lock(),
            vec![PtzResult::TimedOut, PtzResult::Completed, PtzResult::Completed]
        );
        assert_eq!(adapter.commands.lock().len(), 1);
        assert_eq!(
            queue.enqueue(SessionId(1), PtzCommand::preset(1, 50), None),
            PtzOutcome::Rejected
        );
    }
}
