//! Boundary to the protocol glue (ONVIF/HTTP/TCP/RTSP).
//!
//! The core never builds transport bytes. It asks the adapter to describe a
//! logical [`Operation`] for a camera, hands the resulting [`Request`] over
//! and returns immediately. Completions come back later through the
//! [`ReplyTx`] carried by the request, from whatever thread the adapter uses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{CameraConfig, CameraProtocol};
use crate::error::{AdapterError, ErrorKind};
use crate::onvif::Capabilities;
use crate::ptz::{PtzCommand, PtzReply};
use crate::stream::Trigger;
use crate::types::{CameraIndex, MediaFrame, StreamParams, StreamType};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Logical operations the core asks a camera to perform
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FetchStreamConfig,
    PushStreamConfig(StreamParams),
    OnvifEntryPoint,
    OnvifBrandModel,
    OnvifCapabilities,
    /// Single-shot media open for HTTP/TCP style transports
    OpenMedia,
    Describe,
    Setup,
    Play,
    StopMedia,
    Ptz(PtzCommand),
}

impl Operation {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Operation::OpenMedia | Operation::Describe | Operation::Setup | Operation::Play
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::FetchStreamConfig => "fetch_stream_config",
            Operation::PushStreamConfig(_) => "push_stream_config",
            Operation::OnvifEntryPoint => "onvif_entry_point",
            Operation::OnvifBrandModel => "onvif_brand_model",
            Operation::OnvifCapabilities => "onvif_capabilities",
            Operation::OpenMedia => "open_media",
            Operation::Describe => "describe",
            Operation::Setup => "setup",
            Operation::Play => "play",
            Operation::StopMedia => "stop_media",
            Operation::Ptz(_) => "ptz",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Onvif,
    Http,
    Tcp,
    Rtsp,
}

/// Platform-specific description of one protocol sub-request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub camera: CameraIndex,
    pub stream: Option<StreamType>,
    pub operation: Operation,
    pub transport: Transport,
    /// `host:port` of the control endpoint; URL templating is the adapter's business
    pub endpoint: String,
}

/// Completion status reported by the adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterStatus {
    Ok,
    Disabled,
    Disconnected,
    Timeout,
    ResourceLimit,
    CapabilityUnknown,
    Failed(String),
}

impl AdapterStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, AdapterStatus::Ok)
    }

    /// `None` on success, otherwise the failure class
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            AdapterStatus::Ok => None,
            AdapterStatus::Disabled => Some(ErrorKind::ChannelDisabled),
            AdapterStatus::Disconnected => Some(ErrorKind::Disconnected),
            AdapterStatus::Timeout | AdapterStatus::Failed(_) => Some(ErrorKind::Transient),
            AdapterStatus::ResourceLimit => Some(ErrorKind::ResourceLimit),
            AdapterStatus::CapabilityUnknown => Some(ErrorKind::Capability),
        }
    }
}

/// Data carried by a control completion
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReplyPayload {
    #[default]
    None,
    StreamConfig(StreamParams),
    EntryPoint(String),
    BrandModel { brand: String, model: String },
    Capabilities(Capabilities),
}

/// Events on an open (or opening) media channel
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A negotiation sub-request finished
    Ack(AdapterStatus),
    Frame(MediaFrame),
    Closed,
}

#[derive(Debug, Clone)]
enum ReplyRoute {
    Stream(mpsc::UnboundedSender<Trigger>),
    Ptz(mpsc::UnboundedSender<PtzReply>),
}

/// Completion handle travelling with a request.
///
/// Sends return `false` once the receiving side is gone; adapters can use that
/// to drop their own per-request state.
#[derive(Debug, Clone)]
pub struct ReplyTx {
    request: RequestId,
    route: ReplyRoute,
}

impl ReplyTx {
    pub(crate) fn for_stream(request: RequestId, tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self {
            request,
            route: ReplyRoute::Stream(tx),
        }
    }

    pub(crate) fn for_ptz(request: RequestId, tx: mpsc::UnboundedSender<PtzReply>) -> Self {
        Self {
            request,
            route: ReplyRoute::Ptz(tx),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request
    }

    pub fn control(&self, status: AdapterStatus, payload: ReplyPayload) -> bool {
        match &self.route {
            ReplyRoute::Stream(tx) => tx
                .send(Trigger::ControlCb {
                    request: self.request,
                    status,
                    payload,
                })
                .is_ok(),
            ReplyRoute::Ptz(tx) => tx
                .send(PtzReply {
                    request: self.request,
                    status,
                })
                .is_ok(),
        }
    }

    pub fn media(&self, event: MediaEvent) -> bool {
        match &self.route {
            ReplyRoute::Stream(tx) => tx
                .send(Trigger::MediaCb {
                    request: self.request,
                    event,
                })
                .is_ok(),
            ReplyRoute::Ptz(_) => false,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub descriptor: RequestDescriptor,
    pub reply: ReplyTx,
}

/// The protocol glue the core drives.
///
/// `send_request` must not block: it registers the request and returns. Any
/// synchronous refusal is reported as an [`AdapterError`].
pub trait ProtocolAdapter: Send + Sync + 'static {
    fn describe(
        &self,
        camera: &CameraConfig,
        stream: Option<StreamType>,
        operation: Operation,
    ) -> RequestDescriptor {
        let transport = match (camera.protocol, operation.is_media()) {
            (CameraProtocol::Onvif, true) | (CameraProtocol::Rtsp, _) => Transport::Rtsp,
            (CameraProtocol::Onvif, false) => Transport::Onvif,
            (CameraProtocol::Http, _) => Transport::Http,
            (CameraProtocol::Tcp, _) => Transport::Tcp,
        };
        RequestDescriptor {
            camera: CameraIndex(camera.index),
            stream,
            operation,
            transport,
            endpoint: format!("{}:{}", camera.host, camera.control_port),
        }
    }

    fn send_request(&self, request: Request) -> Result<(), AdapterError>;

    fn cancel(&self, _request: RequestId) {}
}

/// Sink for camera-level event state owned outside the core
pub trait CameraEvents: Send + Sync + 'static {
    fn mark_inactive(&self, camera: CameraIndex);
}

#[derive(Debug, Default)]
pub struct NoopEvents;

impl CameraEvents for NoopEvents {
    fn mark_inactive(&self, camera: CameraIndex) {
        debug!(%camera, "camera events marked inactive");
    }
}

/// Adapter that acknowledges every control request and logs it.
///
/// Media channels are acknowledged but never produce frames. Used by the
/// binary when no real protocol glue is linked in.
#[derive(Debug, Default)]
pub struct LoggingAdapter;

impl ProtocolAdapter for LoggingAdapter {
    fn send_request(&self, request: Request) -> Result<(), AdapterError> {
        let descriptor = &request.descriptor;
        info!(
            "📤 {} {} {:?} via {:?} -> {}",
            request.id,
            descriptor.camera,
            descriptor.operation.name(),
            descriptor.transport,
            descriptor.endpoint
        );

        if descriptor.operation.is_media() {
            request.reply.media(MediaEvent::Ack(AdapterStatus::Ok));
            return Ok(());
        }

        let payload = match &descriptor.operation {
            Operation::OnvifEntryPoint => {
                ReplyPayload::EntryPoint(format!("http://{}/onvif/device_service", descriptor.endpoint))
            }
            Operation::OnvifBrandModel => ReplyPayload::BrandModel {
                brand: "generic".to_string(),
                model: "onvif".to_string(),
            },
            Operation::OnvifCapabilities => ReplyPayload::Capabilities(Capabilities::default()),
            _ => ReplyPayload::None,
        };
        request.reply.control(AdapterStatus::Ok, payload);
        Ok(())
    }
}
