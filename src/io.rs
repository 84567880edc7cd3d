//! Suspending I/O requests and their resumption values.
//!
//! User code may suspend ONLY at one of these request boundaries. A request
//! is carried inside the `Suspend` event, persisted inside the checkpoint's
//! suspended flow state, and — on resume — answered with a [`ResumeValue`]
//! of the matching shape.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::ids::{SessionId, TxId};

/// A suspending I/O request issued by user code.
///
/// Ordered maps/sets keep the pure transition function deterministic: the
/// same request always walks its sessions in the same order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowIoRequest {
    /// Send one payload to each listed session; resumes immediately after
    /// the sends are staged.
    Send { payloads: BTreeMap<SessionId, Vec<u8>> },

    /// Park until every listed session has at least one buffered message.
    Receive { sessions: BTreeSet<SessionId> },

    /// [`Send`](Self::Send) then [`Receive`](Self::Receive) on the same
    /// sessions in one suspension.
    SendAndReceive { payloads: BTreeMap<SessionId, Vec<u8>> },

    /// Gracefully close the listed sessions with end-of-session envelopes.
    CloseSessions { sessions: BTreeSet<SessionId> },

    /// Park until the ledger reports `tx_id` committed.
    WaitForLedgerCommit { tx_id: TxId },

    /// Park until every initiated session has been confirmed by its
    /// responder.
    WaitForSessionConfirmations,

    /// Park until the host completes the async operation named by `handle`.
    ExecuteAsync { handle: String },

    /// Park for `duration` of wall-clock time.
    Sleep { duration: Duration },

    /// Persist a checkpoint even where one would otherwise be skippable.
    ForceCheckpoint,
}

impl FlowIoRequest {
    /// Short label for logs and lifecycle events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FlowIoRequest::Send { .. } => "send",
            FlowIoRequest::Receive { .. } => "receive",
            FlowIoRequest::SendAndReceive { .. } => "send_and_receive",
            FlowIoRequest::CloseSessions { .. } => "close_sessions",
            FlowIoRequest::WaitForLedgerCommit { .. } => "wait_for_ledger_commit",
            FlowIoRequest::WaitForSessionConfirmations => "wait_for_session_confirmations",
            FlowIoRequest::ExecuteAsync { .. } => "execute_async",
            FlowIoRequest::Sleep { .. } => "sleep",
            FlowIoRequest::ForceCheckpoint => "force_checkpoint",
        }
    }

    /// Sessions this request wants to receive from, if any.
    #[must_use]
    pub fn receive_targets(&self) -> BTreeSet<SessionId> {
        match self {
            FlowIoRequest::Receive { sessions } => sessions.clone(),
            FlowIoRequest::SendAndReceive { payloads } => payloads.keys().copied().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Whether the request is satisfied the moment its sends are staged,
    /// without waiting for any inbound event.
    #[must_use]
    pub fn fulfilled_on_suspend(&self) -> bool {
        matches!(
            self,
            FlowIoRequest::Send { .. }
                | FlowIoRequest::CloseSessions { .. }
                | FlowIoRequest::ForceCheckpoint
        )
    }
}

/// The value handed back to user code when a suspension resumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeValue {
    /// The request completed with nothing to return (`Send`,
    /// `CloseSessions`, `Sleep`, `ForceCheckpoint`, confirmations).
    Acknowledged,
    /// One payload per awaited session, in session-id order.
    Messages(BTreeMap<SessionId, Vec<u8>>),
    /// The awaited ledger transaction committed.
    LedgerCommitted(TxId),
    /// Result of a host-side async operation.
    AsyncResult(Vec<u8>),
}
