//! ONVIF discovery record shared by a camera's two streams.
//!
//! Discovery runs entry point → brand/model → capabilities. Whichever stream
//! brings the camera up first fills the record; the sibling stream then skips
//! the steps that are already known. The record is cleared when the camera
//! drops off the network or its address changes.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::adapter::{Operation, ReplyPayload};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capabilities {
    pub media: bool,
    pub ptz: bool,
    pub imaging: bool,
    pub events: bool,
    pub profiles: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            media: true,
            ptz: false,
            imaging: false,
            events: false,
            profiles: vec!["main".to_string(), "sub".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryRecord {
    pub entry_point: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Default)]
pub struct OnvifDiscovery {
    record: RwLock<DiscoveryRecord>,
}

impl OnvifDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery operations still needed, in order
    pub fn pending_steps(&self) -> Vec<Operation> {
        let record = self.record.read();
        let mut steps = Vec::new();
        if record.entry_point.is_none() {
            steps.push(Operation::OnvifEntryPoint);
        }
        if record.brand.is_none() || record.model.is_none() {
            steps.push(Operation::OnvifBrandModel);
        }
        if record.capabilities.is_none() {
            steps.push(Operation::OnvifCapabilities);
        }
        steps
    }

    pub fn is_complete(&self) -> bool {
        self.pending_steps().is_empty()
    }

    /// Record the result of a discovery step.
    ///
    /// Returns `false` when the payload does not answer the step, which the
    /// caller treats as a capability error.
    pub fn apply(&self, operation: &Operation, payload: &ReplyPayload) -> bool {
        let mut record = self.record.write();
        match (operation, payload) {
            (Operation::OnvifEntryPoint, ReplyPayload::EntryPoint(url)) => {
                debug!("ONVIF entry point {}", url);
                record.entry_point = Some(url.clone());
                true
            }
            (Operation::OnvifBrandModel, ReplyPayload::BrandModel { brand, model }) => {
                info!("ONVIF device identified as {} {}", brand, model);
                record.brand = Some(brand.clone());
                record.model = Some(model.clone());
                true
            }
            (Operation::OnvifCapabilities, ReplyPayload::Capabilities(caps)) => {
                record.capabilities = Some(caps.clone());
                true
            }
            _ => false,
        }
    }

    pub fn reset(&self) {
        *self.record.write() = DiscoveryRecord::default();
    }

    pub fn snapshot(&self) -> DiscoveryRecord {
        self.record.read().clone()
    }
}
