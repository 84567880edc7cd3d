//! The user-facing flow abstraction.
//!
//! A flow is written as an explicit state machine rather than a frozen
//! stack: the runtime calls [`FlowLogic::resume`] with the result of the
//! previous suspension, and the flow advances to its next I/O request or
//! finishes. The flow object's own serde state *is* the continuation that
//! gets checkpointed — typically a struct with a stage enum, serialized via
//! serde and restored by the [`FlowRegistry`](crate::registry::FlowRegistry).
//!
//! Non-suspending capabilities (opening sessions, entering sub-flows,
//! reporting progress) are recorded on the [`FlowContext`] and drained by
//! the worker as events between polls, so the pure transition function sees
//! them in program order.
//!
//! # Examples
//!
//! ```rust
//! use flowstate::flow::{FlowContext, FlowLogic, FlowPoll, ResumeInput};
//! use flowstate::errors::FlowException;
//! use flowstate::io::{FlowIoRequest, ResumeValue};
//! use serde::{Deserialize, Serialize};
//! use std::collections::BTreeMap;
//!
//! #[derive(Serialize, Deserialize)]
//! enum Stage { Greet, AwaitReply }
//!
//! #[derive(Serialize, Deserialize)]
//! struct GreeterFlow { stage: Stage, peer: String }
//!
//! impl FlowLogic for GreeterFlow {
//!     fn resume(
//!         &mut self,
//!         ctx: &mut FlowContext,
//!         input: ResumeInput,
//!     ) -> Result<FlowPoll, FlowException> {
//!         match self.stage {
//!             Stage::Greet => {
//!                 let session = ctx.initiate_session(self.peer.as_str().into());
//!                 self.stage = Stage::AwaitReply;
//!                 let mut payloads = BTreeMap::new();
//!                 payloads.insert(session, b"hello".to_vec());
//!                 Ok(FlowPoll::suspend(FlowIoRequest::SendAndReceive { payloads }))
//!             }
//!             Stage::AwaitReply => match input {
//!                 ResumeInput::Value(ResumeValue::Messages(replies)) => {
//!                     let reply = replies.into_values().next().unwrap_or_default();
//!                     Ok(FlowPoll::finished(reply))
//!                 }
//!                 _ => Err(FlowException::new("expected a reply")),
//!             },
//!         }
//!     }
//!
//!     fn continuation(&self) -> Result<Vec<u8>, flowstate::checkpoint::codec::CodecError> {
//!         serde_json::to_vec(self).map_err(|e| {
//!             flowstate::checkpoint::codec::CodecError::Serialize { message: e.to_string() }
//!         })
//!     }
//! }
//! ```

use std::time::Duration;

use crate::checkpoint::codec::CodecError;
use crate::errors::FlowException;
use crate::events::Event;
use crate::ids::{FlowId, PeerId, SessionId};
use crate::io::{FlowIoRequest, ResumeValue};

/// What a poll of user code produced.
#[derive(Clone, Debug)]
pub enum FlowPoll {
    /// The flow hit an I/O request boundary and wants to suspend.
    Suspend {
        request: FlowIoRequest,
        /// Hint that this suspension does not need a durable checkpoint.
        /// Idempotent sub-flow frames imply this regardless of the hint.
        may_skip_checkpoint: bool,
    },
    /// The flow returned a result.
    Finished { result: Vec<u8> },
}

impl FlowPoll {
    #[must_use]
    pub fn suspend(request: FlowIoRequest) -> Self {
        FlowPoll::Suspend {
            request,
            may_skip_checkpoint: false,
        }
    }

    #[must_use]
    pub fn suspend_skippable(request: FlowIoRequest) -> Self {
        FlowPoll::Suspend {
            request,
            may_skip_checkpoint: true,
        }
    }

    #[must_use]
    pub fn finished(result: Vec<u8>) -> Self {
        FlowPoll::Finished { result }
    }
}

/// What the runtime hands to user code when it wakes it.
#[derive(Clone, Debug)]
pub enum ResumeInput {
    /// First poll of a freshly started flow.
    Start,
    /// The previous suspension completed with this value.
    Value(ResumeValue),
    /// The previous suspension failed; the flow may catch this by returning
    /// a new poll instead of an error.
    Failed(FlowException),
}

/// A user-defined workflow.
///
/// Implementations must be deterministic given the same sequence of resume
/// inputs: replay after a crash re-drives the flow from its last checkpoint
/// and relies on it taking the same path.
pub trait FlowLogic: Send {
    /// Advance to the next I/O request or completion.
    fn resume(
        &mut self,
        ctx: &mut FlowContext,
        input: ResumeInput,
    ) -> Result<FlowPoll, FlowException>;

    /// Serialize this flow's state for the checkpoint blob. The registry's
    /// restore function is the inverse.
    fn continuation(&self) -> Result<Vec<u8>, CodecError>;
}

/// Non-suspending commands recorded by user code between two polls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowCommand {
    InitiateFlow { peer: PeerId },
    EnterSubFlow {
        flow_class: String,
        version: u32,
        idempotent: bool,
        timed: bool,
    },
    LeaveSubFlow,
    UpdateFlowTimeout { timeout: Duration },
    RecordProgress { step: String },
    MarkSoftLocked,
}

impl FlowCommand {
    /// The event this command becomes when the worker drains it.
    #[must_use]
    pub(crate) fn into_event(self) -> Event {
        match self {
            FlowCommand::InitiateFlow { peer } => Event::InitiateFlow { peer },
            FlowCommand::EnterSubFlow {
                flow_class,
                version,
                idempotent,
                timed,
            } => Event::EnterSubFlow {
                flow_class,
                version,
                idempotent,
                timed,
            },
            FlowCommand::LeaveSubFlow => Event::LeaveSubFlow,
            FlowCommand::UpdateFlowTimeout { timeout } => Event::UpdateFlowTimeout { timeout },
            FlowCommand::RecordProgress { step } => Event::RecordProgress { step },
            FlowCommand::MarkSoftLocked => Event::MarkSoftLocked,
        }
    }
}

/// Capability surface handed to user code on every poll.
///
/// Session ids are allocated here deterministically from
/// `(flow id, ordinal)`, so the pure transition function — which sees the
/// corresponding [`Event::InitiateFlow`] later — derives exactly the same
/// id without shared state.
#[derive(Debug)]
pub struct FlowContext {
    flow_id: FlowId,
    our_identity: PeerId,
    next_session_ordinal: u64,
    sessions: Vec<(SessionId, PeerId)>,
    commands: Vec<FlowCommand>,
}

impl FlowContext {
    pub(crate) fn new(
        flow_id: FlowId,
        our_identity: PeerId,
        next_session_ordinal: u64,
        sessions: Vec<(SessionId, PeerId)>,
    ) -> Self {
        Self {
            flow_id,
            our_identity,
            next_session_ordinal,
            sessions,
            commands: Vec::new(),
        }
    }

    /// This flow's sessions and their counterparties, in session-id order.
    /// A responder finds its initiating session here.
    #[must_use]
    pub fn sessions(&self) -> &[(SessionId, PeerId)] {
        &self.sessions
    }

    /// The id of the flow being polled.
    #[must_use]
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// This node's identity.
    #[must_use]
    pub fn our_identity(&self) -> &PeerId {
        &self.our_identity
    }

    /// Open a session towards `peer`. The session becomes usable for
    /// `Send`/`Receive` requests immediately; the `Init` envelope goes out
    /// with the first suspension that sends on it.
    pub fn initiate_session(&mut self, peer: PeerId) -> SessionId {
        let session_id = SessionId::derive(self.flow_id, self.next_session_ordinal);
        self.next_session_ordinal += 1;
        self.commands.push(FlowCommand::InitiateFlow { peer });
        session_id
    }

    /// Push a sub-flow frame. Idempotent sub-flows permit checkpoint
    /// skipping; timed sub-flows arm the safe-point retry timeout.
    pub fn enter_sub_flow(
        &mut self,
        flow_class: impl Into<String>,
        version: u32,
        idempotent: bool,
        timed: bool,
    ) {
        self.commands.push(FlowCommand::EnterSubFlow {
            flow_class: flow_class.into(),
            version,
            idempotent,
            timed,
        });
    }

    /// Pop the current sub-flow frame.
    pub fn leave_sub_flow(&mut self) {
        self.commands.push(FlowCommand::LeaveSubFlow);
    }

    /// Declare or move this flow's wait-timeout. On expiry with no progress
    /// the manager retries the flow from its last safe point.
    pub fn update_timed_flow_timeout(&mut self, timeout: Duration) {
        self.commands.push(FlowCommand::UpdateFlowTimeout { timeout });
    }

    /// Report a human-readable progress step, persisted with the next
    /// checkpoint.
    pub fn set_progress(&mut self, step: impl Into<String>) {
        self.commands.push(FlowCommand::RecordProgress { step: step.into() });
    }

    /// Set the sticky soft-lock flag. Settable only false→true; the lock is
    /// released when the flow terminates.
    pub fn mark_soft_locked(&mut self) {
        self.commands.push(FlowCommand::MarkSoftLocked);
    }

    pub(crate) fn take_commands(&mut self) -> Vec<FlowCommand> {
        std::mem::take(&mut self.commands)
    }
}
