//! Events delivered to a flow's worker.
//!
//! Events are transient: they are never persisted. Everything durable lives
//! in the checkpoint; events are how the outside world (and the flow's own
//! user code) pokes the state machine.

use std::time::Duration;

use crate::errors::FlowError;
use crate::ids::{PeerId, SessionId, SoftLockId};
use crate::io::FlowIoRequest;
use crate::messages::SessionMessage;

/// One unit of work for the flow state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Generic kick: start an unstarted flow, or re-evaluate whether the
    /// current suspension is now satisfiable.
    DoRemainingWork,

    /// A session message arrived from the bus.
    DeliverSessionMessage {
        session_id: SessionId,
        message: SessionMessage,
    },

    /// A classified failure to act on.
    Error { error: FlowError },

    /// User code hit an I/O request boundary. Posted synchronously by the
    /// worker so the checkpoint write commits atomically with the sends.
    Suspend {
        request: FlowIoRequest,
        may_skip_checkpoint: bool,
        continuation: Vec<u8>,
    },

    /// User code returned.
    FlowFinish {
        result: Vec<u8>,
        soft_lock_id: Option<SoftLockId>,
    },

    /// User code invoked a sub-flow.
    EnterSubFlow {
        flow_class: String,
        version: u32,
        idempotent: bool,
        timed: bool,
    },

    /// The current sub-flow returned.
    LeaveSubFlow,

    /// User code opened a session towards `peer`.
    InitiateFlow { peer: PeerId },

    /// A host-side async operation (or awaited ledger commit) completed.
    AsyncOperationCompletion { result: Vec<u8> },

    /// A `Sleep` timer fired.
    WakeUpFromSleep,

    /// Reset to the last persisted checkpoint and re-drive. Enqueued by the
    /// manager on timed-flow expiry and by the retry backoff machinery.
    RetryFlowFromSafePoint,

    /// User code declared (or moved) its timed-flow wait-timeout.
    UpdateFlowTimeout { timeout: Duration },

    /// User code reported a progress step.
    RecordProgress { step: String },

    /// User code set the sticky soft-lock flag.
    MarkSoftLocked,
}

impl Event {
    /// Short label for logs, applicability errors, and lifecycle events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DoRemainingWork => "do_remaining_work",
            Event::DeliverSessionMessage { .. } => "deliver_session_message",
            Event::Error { .. } => "error",
            Event::Suspend { .. } => "suspend",
            Event::FlowFinish { .. } => "flow_finish",
            Event::EnterSubFlow { .. } => "enter_sub_flow",
            Event::LeaveSubFlow => "leave_sub_flow",
            Event::InitiateFlow { .. } => "initiate_flow",
            Event::AsyncOperationCompletion { .. } => "async_operation_completion",
            Event::WakeUpFromSleep => "wake_up_from_sleep",
            Event::RetryFlowFromSafePoint => "retry_flow_from_safe_point",
            Event::UpdateFlowTimeout { .. } => "update_flow_timeout",
            Event::RecordProgress { .. } => "record_progress",
            Event::MarkSoftLocked => "mark_soft_locked",
        }
    }
}
