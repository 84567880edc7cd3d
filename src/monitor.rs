//! Lifecycle observability.
//!
//! The runtime narrates each flow's life — started, suspended,
//! checkpointed, retried, errored, finished — to a set of monitor sinks.
//! This is the observable event surface for hosts and tests; metrics and
//! dashboards are built on top of it outside the core.

use serde::{Deserialize, Serialize};

use crate::ids::FlowId;

/// One lifecycle fact about a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowLifecycleEvent {
    /// The initial checkpoint is durable and user code is about to run.
    Started { flow_id: FlowId },
    /// The flow parked at an I/O request.
    Suspended {
        flow_id: FlowId,
        request: String,
        suspend_count: u64,
    },
    /// A checkpoint revision was staged for commit.
    CheckpointPersisted { flow_id: FlowId, revision: u64 },
    /// A safe-point retry was applied.
    Retried { flow_id: FlowId, attempt: u32 },
    /// The flow entered the errored state.
    Errored { flow_id: FlowId, message: String },
    /// Soft-locked ledger states were released.
    SoftLocksReleased { flow_id: FlowId },
    /// The flow reached a terminal state.
    Finished { flow_id: FlowId, outcome: String },
}

/// A sink for lifecycle events. Implementations must be cheap and
/// non-blocking; they run on the worker's event loop.
pub trait FlowMonitor: Send + Sync {
    fn handle(&self, event: &FlowLifecycleEvent);
}

/// Sink that forwards lifecycle events onto tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl FlowMonitor for TracingMonitor {
    fn handle(&self, event: &FlowLifecycleEvent) {
        match event {
            FlowLifecycleEvent::Errored { flow_id, message } => {
                tracing::warn!(flow_id = %flow_id, message = %message, "flow errored");
            }
            other => {
                tracing::debug!(event = ?other, "flow lifecycle");
            }
        }
    }
}

/// Sink that streams lifecycle events onto a flume channel, for tests and
/// host dashboards.
pub struct ChannelMonitor {
    tx: flume::Sender<FlowLifecycleEvent>,
}

impl ChannelMonitor {
    #[must_use]
    pub fn new(tx: flume::Sender<FlowLifecycleEvent>) -> Self {
        Self { tx }
    }
}

impl FlowMonitor for ChannelMonitor {
    fn handle(&self, event: &FlowLifecycleEvent) {
        // A full or disconnected channel must not stall the worker.
        let _ = self.tx.try_send(event.clone());
    }
}

/// The set of sinks a manager fans lifecycle events out to.
#[derive(Clone, Default)]
pub struct MonitorSet {
    sinks: Vec<std::sync::Arc<dyn FlowMonitor>>,
}

impl MonitorSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl FlowMonitor + 'static) -> Self {
        self.sinks.push(std::sync::Arc::new(sink));
        self
    }

    #[must_use]
    pub fn with_shared_sink(mut self, sink: std::sync::Arc<dyn FlowMonitor>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn emit(&self, event: &FlowLifecycleEvent) {
        for sink in &self.sinks {
            sink.handle(event);
        }
    }
}
