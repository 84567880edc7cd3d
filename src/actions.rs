//! Side effects requested by the transition function.
//!
//! The transition function decides; actions are how it says what should
//! happen. The action executor applies them strictly in list order, inside
//! the flow's open store transaction. Every action is idempotent with
//! respect to its `(flow id, suspend count)` key: replaying a list after a
//! crash must not double-persist, and resent messages carry identical
//! deduplication ids so the receiving side drops them.

use std::time::Duration;

use crate::errors::FlowException;
use crate::events::Event;
use crate::ids::{PeerId, SessionId, SoftLockId};
use crate::messages::{DeduplicationId, SessionMessage};

/// A fully addressed outbound envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub peer: PeerId,
    pub message: SessionMessage,
}

/// One unit of side effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Stage the post-transition checkpoint into the open transaction.
    PersistCheckpoint,

    /// Stage deletion of the flow's checkpoint.
    RemoveCheckpoint,

    /// Stage the session-opening `Init` envelope for a session leaving
    /// `Uninitiated`.
    SendInitial {
        session_id: SessionId,
        peer: PeerId,
        flow_class: String,
        flow_version: u32,
        payload: Vec<u8>,
        dedup: DeduplicationId,
    },

    /// Stage an envelope on an established session.
    SendExisting {
        peer: PeerId,
        message: SessionMessage,
    },

    /// Stage a batch of envelopes (end-of-session fan-out and the like).
    SendMultiple { messages: Vec<Outbound> },

    /// Post an event back to this flow's own inbox, optionally after a
    /// delay.
    ScheduleEvent {
        event: Box<Event>,
        after: Option<Duration>,
    },

    /// Arm a one-shot timer that posts `WakeUpFromSleep`.
    SleepUntil { duration: Duration },

    /// Acknowledge consumed inbound messages to the bus (staged; flushed on
    /// commit).
    AcknowledgeMessages { deduplication_ids: Vec<String> },

    /// Serialize the given exceptions into `Reject` envelopes for every
    /// open session.
    PropagateErrors { errors: Vec<FlowException> },

    /// Open a fresh store transaction (suspension boundary).
    CreateTransaction,

    /// Commit the open transaction, flushing staged checkpoint writes,
    /// outbound messages, and acknowledgements atomically.
    CommitTransaction,

    /// Discard the open transaction and everything staged on it.
    RollbackTransaction,

    /// Release the flow's soft-locked ledger states.
    ReleaseSoftLocks { lock_id: Option<SoftLockId> },

    /// Resolve the start-waiters for this flow: its initial checkpoint is
    /// durable and user code is about to run.
    SignalFlowHasStarted,

    /// Arm (or move) the timed-flow wait-timeout.
    ScheduleFlowTimeout { timeout: Duration },

    /// Disarm the timed-flow wait-timeout.
    CancelFlowTimeout,

    /// Record the outbound dedup sequence watermark for a session, so
    /// checkpoint-skipping suspensions never reuse a sequence after replay.
    UpdateDeduplicationId {
        session_id: SessionId,
        sequence: u64,
    },

    /// Unrecoverable runtime failure: flush logs and halt the process.
    HaltProcess,
}

impl Action {
    /// Short label for logs and interceptors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Action::PersistCheckpoint => "persist_checkpoint",
            Action::RemoveCheckpoint => "remove_checkpoint",
            Action::SendInitial { .. } => "send_initial",
            Action::SendExisting { .. } => "send_existing",
            Action::SendMultiple { .. } => "send_multiple",
            Action::ScheduleEvent { .. } => "schedule_event",
            Action::SleepUntil { .. } => "sleep_until",
            Action::AcknowledgeMessages { .. } => "acknowledge_messages",
            Action::PropagateErrors { .. } => "propagate_errors",
            Action::CreateTransaction => "create_transaction",
            Action::CommitTransaction => "commit_transaction",
            Action::RollbackTransaction => "rollback_transaction",
            Action::ReleaseSoftLocks { .. } => "release_soft_locks",
            Action::SignalFlowHasStarted => "signal_flow_has_started",
            Action::ScheduleFlowTimeout { .. } => "schedule_flow_timeout",
            Action::CancelFlowTimeout => "cancel_flow_timeout",
            Action::UpdateDeduplicationId { .. } => "update_deduplication_id",
            Action::HaltProcess => "halt_process",
        }
    }
}
