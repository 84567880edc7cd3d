//! Flow hospital collaborator.
//!
//! The hospital quarantines errored flows for operator attention. Diagnosis
//! and readmission policy are host concerns; the core only admits flows
//! whose checkpoint is retained in `Errored`, and discharges them when an
//! operator-driven retry succeeds.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::checkpoint::CheckpointView;
use crate::errors::FlowError;
use crate::ids::FlowId;

#[async_trait]
pub trait Hospital: Send + Sync {
    /// Quarantine a flow. The checkpoint stays in the store.
    async fn admit(&self, flow_id: FlowId, reason: FlowError, checkpoint: CheckpointView);

    /// Release a previously admitted flow.
    async fn discharge(&self, flow_id: FlowId);
}

/// Default hospital: a structured log line per admission.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHospital;

#[async_trait]
impl Hospital for TracingHospital {
    async fn admit(&self, flow_id: FlowId, reason: FlowError, checkpoint: CheckpointView) {
        tracing::warn!(
            flow_id = %flow_id,
            flow_class = %checkpoint.flow_class,
            suspend_count = checkpoint.suspend_count,
            reason = %reason,
            "flow admitted to hospital"
        );
    }

    async fn discharge(&self, flow_id: FlowId) {
        tracing::info!(flow_id = %flow_id, "flow discharged from hospital");
    }
}

/// Test hospital that records admissions for assertions.
#[derive(Default)]
pub struct RecordingHospital {
    admissions: Mutex<Vec<(FlowId, String)>>,
}

impl RecordingHospital {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn admissions(&self) -> Vec<(FlowId, String)> {
        self.admissions
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Hospital for RecordingHospital {
    async fn admit(&self, flow_id: FlowId, reason: FlowError, _checkpoint: CheckpointView) {
        if let Ok(mut admissions) = self.admissions.lock() {
            admissions.push((flow_id, reason.to_string()));
        }
    }

    async fn discharge(&self, flow_id: FlowId) {
        if let Ok(mut admissions) = self.admissions.lock() {
            admissions.retain(|(id, _)| *id != flow_id);
        }
    }
}
