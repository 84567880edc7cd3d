//! Error taxonomy for the flow runtime.
//!
//! Every failure the runtime can observe is funnelled into [`FlowError`] and
//! classified into one of four [`ErrorClass`]es. The transition function
//! classifies; the worker never recovers locally — it always surfaces a
//! classified event and lets the transition decide between halting the
//! process, admitting the flow to the hospital, scheduling a safe-point
//! retry, or propagating a user-visible exception to the counterparties.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::codec::CodecError;
use crate::checkpoint::store::StoreError;
use crate::ids::SessionId;

/// How a failure must be handled, per the propagation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Process-wide corruption (VM-level memory errors, not stack overflow):
    /// halt the process after a log flush.
    Unrecoverable,
    /// The flow cannot make progress; admit to the hospital with the
    /// checkpoint retained in `Errored`.
    FatalToFlow,
    /// Transient infrastructure failure (DB deadlock, broker disconnect):
    /// roll back and retry from the last safe point with bounded backoff.
    Retryable,
    /// A failure user code may catch, and which propagates to the
    /// counterparty on the affected sessions.
    UserVisible,
}

/// A user-visible flow failure.
///
/// These are values, not control flow: user code returns them from
/// [`FlowLogic::resume`](crate::flow::FlowLogic::resume), catches them when
/// a transition hands back [`Continuation::Throw`](crate::transition::Continuation),
/// and the action executor serializes them into `Reject` envelopes for every
/// open session when a flow dies with one uncaught.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic, Serialize, Deserialize)]
#[error("{message}")]
#[diagnostic(code(flowstate::flow::exception))]
pub struct FlowException {
    pub message: String,
    /// Name of the flow class that raised the exception, when known.
    pub originating_class: Option<String>,
}

impl FlowException {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            originating_class: None,
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.originating_class = Some(class.into());
        self
    }

    /// Serialize for a `Reject` envelope payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, FlowError> {
        serde_json::to_vec(self).map_err(|e| FlowError::Internal {
            message: format!("failed to serialize flow exception: {e}"),
        })
    }

    /// Decode from a `Reject` envelope payload. Undecodable payloads become
    /// an opaque exception rather than an error: the counterparty is telling
    /// us it failed either way.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|_| {
            Self::new("counterparty rejected the session with an undecodable error")
        })
    }
}

/// Every failure the runtime classifies and acts on.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum FlowError {
    /// Checkpoint blob could not be encoded or decoded.
    #[error(transparent)]
    #[diagnostic(code(flowstate::error::codec))]
    Codec(#[from] CodecError),

    /// Checkpoint store failure.
    #[error(transparent)]
    #[diagnostic(code(flowstate::error::store))]
    Store(#[from] StoreError),

    /// Message bus failure.
    #[error("message bus error: {message}")]
    #[diagnostic(
        code(flowstate::error::bus),
        help("The broker may be restarting; the flow retries from its last safe point.")
    )]
    Bus { message: String },

    /// A session message arrived for a session this flow does not own.
    #[error("session {session_id} is unknown to this flow")]
    #[diagnostic(code(flowstate::error::unknown_session))]
    UnknownSession { session_id: SessionId },

    /// A session message arrived for a session that has already closed.
    #[error("session {session_id} is closed")]
    #[diagnostic(code(flowstate::error::closed_session))]
    ClosedSession { session_id: SessionId },

    /// A second `Init` arrived carrying a session id already in use.
    #[error("duplicate session initiation for session {session_id}")]
    #[diagnostic(code(flowstate::error::duplicate_init))]
    DuplicateSessionInit { session_id: SessionId },

    /// The counterparty speaks an incompatible protocol version.
    #[error("protocol version mismatch on session {session_id}: ours {ours}, theirs {theirs}")]
    #[diagnostic(code(flowstate::error::version_mismatch))]
    VersionMismatch {
        session_id: SessionId,
        ours: u32,
        theirs: u32,
    },

    /// An event was delivered that is not applicable to the flow's current
    /// state, e.g. `Suspend` on a completed flow.
    #[error("event {event} is not applicable while the flow is {state}")]
    #[diagnostic(
        code(flowstate::error::not_applicable),
        help("This indicates a runtime bug or a corrupted checkpoint, not a user error.")
    )]
    NotApplicable {
        event: &'static str,
        state: &'static str,
    },

    /// `LeaveSubFlow` with an empty sub-flow stack.
    #[error("sub-flow stack underflow")]
    #[diagnostic(code(flowstate::error::subflow_underflow))]
    SubFlowStackUnderflow,

    /// The flow was cancelled from outside.
    #[error("flow cancelled: {reason}")]
    #[diagnostic(code(flowstate::error::cancelled))]
    Cancelled { reason: String },

    /// Transient infrastructure failure, safe to retry.
    #[error("transient failure: {message}")]
    #[diagnostic(code(flowstate::error::transient))]
    Transient { message: String },

    /// The runtime reported memory corruption or exhaustion at the VM level.
    #[error("unrecoverable runtime memory error")]
    #[diagnostic(
        code(flowstate::error::out_of_memory),
        help("The process halts; flows resume from their checkpoints on restart.")
    )]
    OutOfMemory,

    /// A permission check failed for the requesting flow.
    #[error("flow permission denied: {permission}")]
    #[diagnostic(code(flowstate::error::permission))]
    PermissionDenied { permission: String },

    /// A user-visible exception raised by flow code or a counterparty.
    #[error(transparent)]
    #[diagnostic(transparent)]
    User(#[from] FlowException),

    /// Catch-all for internal invariant violations.
    #[error("internal error: {message}")]
    #[diagnostic(code(flowstate::error::internal))]
    Internal { message: String },
}

impl FlowError {
    /// Classify per the propagation policy. Pure; called from the transition
    /// function.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::OutOfMemory => ErrorClass::Unrecoverable,
            FlowError::Bus { .. } | FlowError::Transient { .. } => ErrorClass::Retryable,
            FlowError::Store(e) if e.is_transient() => ErrorClass::Retryable,
            FlowError::User(_) | FlowError::PermissionDenied { .. } => ErrorClass::UserVisible,
            _ => ErrorClass::FatalToFlow,
        }
    }

    /// The exception to show counterparties and the flow's result future.
    ///
    /// User-visible failures keep their message; internal failures are
    /// deliberately opaque on the wire.
    #[must_use]
    pub fn to_exception(&self) -> FlowException {
        match self {
            FlowError::User(e) => e.clone(),
            FlowError::PermissionDenied { permission } => {
                FlowException::new(format!("permission denied: {permission}"))
            }
            FlowError::Cancelled { reason } => {
                FlowException::new(format!("flow cancelled: {reason}"))
            }
            _ => FlowException::new("counterparty flow failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_taxonomy() {
        assert_eq!(FlowError::OutOfMemory.class(), ErrorClass::Unrecoverable);
        assert_eq!(
            FlowError::Transient {
                message: "db deadlock".into()
            }
            .class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            FlowError::User(FlowException::new("no")).class(),
            ErrorClass::UserVisible
        );
        assert_eq!(
            FlowError::UnknownSession {
                session_id: crate::ids::SessionId::from_raw(9)
            }
            .class(),
            ErrorClass::FatalToFlow
        );
    }

    #[test]
    fn reject_payload_roundtrip_and_fallback() {
        let e = FlowException::new("NotAuthorised").with_class("PaymentFlow");
        let payload = e.to_payload().unwrap();
        assert_eq!(FlowException::from_payload(&payload), e);

        let opaque = FlowException::from_payload(b"\xff\xfe");
        assert!(opaque.message.contains("undecodable"));
    }

    #[test]
    fn internal_failures_propagate_opaquely() {
        let e = FlowError::Internal {
            message: "secret detail".into(),
        };
        assert!(!e.to_exception().message.contains("secret"));
    }
}
