//! The persisted, resumable state of a flow.
//!
//! A [`Checkpoint`] is created (as `Unstarted`) before any user code runs,
//! updated at every persisted suspension, and deleted when the flow finishes
//! — unless the flow failed, in which case it is retained in `Errored` for
//! the hospital.
//!
//! # Submodules
//!
//! - [`codec`] — binary blob envelope + serde persistence models
//! - [`store`] — transactional checkpoint store trait and in-memory backend
//! - `store_sqlite` — durable sqlite backend (feature `sqlite`)

pub mod codec;
pub mod store;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::errors::FlowException;
use crate::ids::{FlowId, PeerId, SessionId};
use crate::io::FlowIoRequest;
use crate::messages::SessionMessage;

/// How and why a flow was started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOrigin {
    /// Started by a local API caller.
    Rpc,
    /// Started as the responder to a counterparty's session initiation.
    Peer { peer: PeerId },
    /// Started by the node's internal scheduler.
    Scheduled,
}

/// Immutable facts about a flow invocation, captured at start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub flow_class: String,
    pub flow_version: u32,
    pub origin: StartOrigin,
    pub started_at: DateTime<Utc>,
    pub start_args: Vec<u8>,
}

/// The lifecycle state of the flow's user code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// Persisted before any user code runs, so a crash before the first
    /// suspension still leaves a replayable record.
    Unstarted,
    /// User code is parked at an I/O request; `continuation` is the codec
    /// blob that reconstructs it.
    Suspended {
        request: FlowIoRequest,
        continuation: Vec<u8>,
    },
    /// User code returned a result.
    Completed { result: Vec<u8> },
    /// The flow died with an uncaught exception.
    Failed { exception: FlowException },
}

impl FlowState {
    /// Short label for logs and applicability errors.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            FlowState::Unstarted => "unstarted",
            FlowState::Suspended { .. } => "suspended",
            FlowState::Completed { .. } => "completed",
            FlowState::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Completed { .. } | FlowState::Failed { .. })
    }
}

/// One entry of the sub-flow stack; the top is the currently executing
/// sub-flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFlowFrame {
    pub flow_class: String,
    pub version: u32,
    /// Idempotent frames permit skipping intermediate checkpoints: their
    /// side effects are safe to replay.
    pub idempotent: bool,
    /// Timed frames arm a wait-timeout that retries the flow from its last
    /// safe point on expiry.
    pub timed: bool,
}

/// A message received on a session but not yet consumed by user code.
///
/// `arrival` is a per-flow counter that totally orders buffered messages
/// across sessions, preserving delivery order where it matters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub arrival: u64,
    pub message: SessionMessage,
}

/// Protocol phase of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Allocated locally; nothing has crossed the wire. A session leaves
    /// this phase only by an `Init` envelope sent within the same committed
    /// suspension as a checkpoint write.
    Uninitiated,
    /// `Init` sent, confirmation pending.
    Initiating {
        payload: Vec<u8>,
        dedup_seed: String,
        /// Next outbound data sequence number.
        sequence: u64,
    },
    /// Handshake complete; data may flow both ways.
    Initiated {
        peer_session_id: SessionId,
        end_of_session_seen: bool,
        /// Next outbound data sequence number.
        sequence: u64,
    },
    /// Closed locally or by the counterparty.
    Closed,
}

impl SessionPhase {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Uninitiated => "uninitiated",
            SessionPhase::Initiating { .. } => "initiating",
            SessionPhase::Initiated { .. } => "initiated",
            SessionPhase::Closed => "closed",
        }
    }
}

/// Everything the flow knows about one of its sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Allocation ordinal within the owning flow; part of the dedup id.
    pub ordinal: u64,
    pub peer: PeerId,
    pub phase: SessionPhase,
    /// Received-but-unconsumed messages, wire FIFO order per session.
    pub inbound: VecDeque<BufferedMessage>,
    /// Lowest data sequence number not yet seen; inbound data below this is
    /// a replay and is acknowledged without buffering.
    pub next_inbound_sequence: u64,
}

impl SessionInfo {
    /// A session still worth telling about our demise.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Initiating { .. } | SessionPhase::Initiated { .. }
        )
    }

    /// Next outbound sequence number, bumping the phase counter.
    pub(crate) fn next_sequence(&mut self) -> u64 {
        match &mut self.phase {
            SessionPhase::Initiating { sequence, .. }
            | SessionPhase::Initiated { sequence, .. } => {
                let seq = *sequence;
                *sequence += 1;
                seq
            }
            _ => 0,
        }
    }

    /// Current outbound sequence watermark without bumping.
    #[must_use]
    pub fn sequence_watermark(&self) -> u64 {
        match &self.phase {
            SessionPhase::Initiating { sequence, .. }
            | SessionPhase::Initiated { sequence, .. } => *sequence,
            _ => 0,
        }
    }
}

/// Whether the flow is healthy or quarantined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
    Clean,
    Errored {
        /// Exceptions pending propagation to the counterparties.
        errors: Vec<FlowException>,
        /// How many times the hospital has seen this flow.
        hospital_visits: u32,
    },
}

impl ErrorState {
    #[must_use]
    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }
}

/// The persisted, resumable state of one flow.
///
/// Invariant: `suspend_count` strictly increases across persisted revisions
/// of the same flow id — every action list containing `PersistCheckpoint`
/// bumps it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub flow_id: FlowId,
    pub invocation: InvocationContext,
    pub our_identity: PeerId,
    pub sub_flow_stack: Vec<SubFlowFrame>,
    pub sessions: BTreeMap<SessionId, SessionInfo>,
    /// Ordinal for the next session this flow opens.
    pub next_session_ordinal: u64,
    /// Per-flow arrival counter stamped onto buffered messages.
    pub arrival_counter: u64,
    pub flow_state: FlowState,
    pub error_state: ErrorState,
    /// Number of persisted suspensions so far; the blob's revision number.
    pub suspend_count: u64,
    /// Safe-point retries performed; feeds the dedup id retry component and
    /// is never reset by a retry itself.
    pub retries: u32,
    /// Sticky soft-lock flag: settable only false→true, released on
    /// terminal finish/abort.
    pub soft_locked: bool,
    /// Wait-timeout declared by a timed flow; re-armed after safe-point
    /// retries.
    pub wait_timeout: Option<std::time::Duration>,
    /// Latest progress step reported by user code.
    pub progress: Option<String>,

    /// Deduplication ids of delivered-but-unacknowledged inbound messages.
    /// Transient: never persisted — unacked messages simply redeliver.
    pub pending_acks: Vec<String>,
    /// True when sends were staged since the last persisted checkpoint.
    /// Transient; drives the persist-on-idempotent-sub-flow-return rule.
    pub unpersisted_sends: bool,
    /// Transient marker set at idempotency boundaries: the next suspension
    /// must persist a checkpoint even if it would otherwise be skippable.
    pub force_persist_on_next_suspend: bool,
}

impl Checkpoint {
    /// The checkpoint pushed before any user code runs. `idempotent` and
    /// `timed` describe the registered root flow type.
    #[must_use]
    pub fn unstarted(
        flow_id: FlowId,
        invocation: InvocationContext,
        our_identity: PeerId,
        idempotent: bool,
        timed: bool,
    ) -> Self {
        let root = SubFlowFrame {
            flow_class: invocation.flow_class.clone(),
            version: invocation.flow_version,
            idempotent,
            timed,
        };
        Self {
            flow_id,
            invocation,
            our_identity,
            sub_flow_stack: vec![root],
            sessions: BTreeMap::new(),
            next_session_ordinal: 0,
            arrival_counter: 0,
            flow_state: FlowState::Unstarted,
            error_state: ErrorState::Clean,
            suspend_count: 0,
            retries: 0,
            soft_locked: false,
            wait_timeout: None,
            progress: None,
            pending_acks: Vec::new(),
            unpersisted_sends: false,
            force_persist_on_next_suspend: false,
        }
    }

    /// True when any frame on the sub-flow stack is idempotent, which makes
    /// intermediate checkpoints skippable.
    #[must_use]
    pub fn any_idempotent_frame(&self) -> bool {
        self.sub_flow_stack.iter().any(|f| f.idempotent)
    }

    /// True when any frame on the sub-flow stack declared a wait-timeout.
    #[must_use]
    pub fn is_timed(&self) -> bool {
        self.sub_flow_stack.iter().any(|f| f.timed)
    }

    /// Sessions that are still open, in session-id order.
    pub fn open_sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.sessions.values().filter(|s| s.is_open())
    }

    /// Drain pending inbound acknowledgements into an owned list, clearing
    /// the transient field.
    pub(crate) fn take_pending_acks(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_acks)
    }

    /// Read-only summary for the observable surface.
    #[must_use]
    pub fn view(&self) -> CheckpointView {
        CheckpointView {
            flow_id: self.flow_id,
            flow_class: self.invocation.flow_class.clone(),
            state: self.flow_state.label().to_string(),
            suspend_count: self.suspend_count,
            retries: self.retries,
            session_count: self.sessions.len(),
            errored: self.error_state.is_errored(),
            progress: self.progress.clone(),
            started_at: self.invocation.started_at,
        }
    }
}

/// Read-only checkpoint summary returned by
/// [`FlowManager::snapshot`](crate::manager::FlowManager::snapshot).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointView {
    pub flow_id: FlowId,
    pub flow_class: String,
    pub state: String,
    pub suspend_count: u64,
    pub retries: u32,
    pub session_count: usize,
    pub errored: bool,
    pub progress: Option<String>,
    pub started_at: DateTime<Utc>,
}
