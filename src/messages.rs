//! Session message envelopes and deduplication ids.
//!
//! Flows on different nodes communicate over bidirectional, FIFO-ordered
//! sessions. Every envelope that crosses the broker carries a deduplication
//! id so the receiving side can drop replays caused by checkpoint-driven
//! retries — the bus only guarantees at-least-once delivery.
//!
//! Both ends of a session route by the same session id: the initiating flow
//! allocates it, the responder adopts it when it confirms. `peer_session_id`
//! is populated once the handshake completes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::ids::SessionId;

/// Discriminates the five envelope kinds of the session protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ordinary application payload.
    Data,
    /// Opens a session; payload is an [`InitPayload`].
    Init,
    /// Graceful end-of-session marker.
    End,
    /// Counterparty failure; payload is a serialized
    /// [`FlowException`](crate::errors::FlowException).
    Reject,
    /// Responder acknowledgement completing the session handshake.
    Confirm,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageKind::Data => "data",
            MessageKind::Init => "init",
            MessageKind::End => "end",
            MessageKind::Reject => "reject",
            MessageKind::Confirm => "confirm",
        };
        write!(f, "{label}")
    }
}

/// Wire envelope for one session message.
///
/// `sequence_number` increases per session per direction and backs the
/// per-session FIFO ordering guarantee. `deduplication_id` is the rendered
/// form of a [`DeduplicationId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub peer_session_id: Option<SessionId>,
    pub sequence_number: u64,
    pub deduplication_id: String,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl SessionMessage {
    /// Build a `Data` envelope.
    #[must_use]
    pub fn data(
        session_id: SessionId,
        peer_session_id: Option<SessionId>,
        sequence_number: u64,
        deduplication_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id,
            peer_session_id,
            sequence_number,
            deduplication_id: deduplication_id.into(),
            kind: MessageKind::Data,
            payload,
        }
    }

    /// Build an `Init` envelope carrying a serialized [`InitPayload`].
    #[must_use]
    pub fn init(
        session_id: SessionId,
        deduplication_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id,
            peer_session_id: None,
            sequence_number: 0,
            deduplication_id: deduplication_id.into(),
            kind: MessageKind::Init,
            payload,
        }
    }

    /// Build an `End` envelope.
    #[must_use]
    pub fn end(
        session_id: SessionId,
        peer_session_id: Option<SessionId>,
        sequence_number: u64,
        deduplication_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            peer_session_id,
            sequence_number,
            deduplication_id: deduplication_id.into(),
            kind: MessageKind::End,
            payload: Vec::new(),
        }
    }

    /// Build a `Reject` envelope carrying a serialized flow exception.
    #[must_use]
    pub fn reject(
        session_id: SessionId,
        peer_session_id: Option<SessionId>,
        sequence_number: u64,
        deduplication_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            session_id,
            peer_session_id,
            sequence_number,
            deduplication_id: deduplication_id.into(),
            kind: MessageKind::Reject,
            payload,
        }
    }

    /// Build a `Confirm` envelope completing the handshake for `session_id`.
    #[must_use]
    pub fn confirm(
        session_id: SessionId,
        deduplication_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            peer_session_id: Some(session_id),
            sequence_number: 0,
            deduplication_id: deduplication_id.into(),
            kind: MessageKind::Confirm,
            payload: Vec::new(),
        }
    }

    /// Whether this envelope terminates the session (`End` or `Reject`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, MessageKind::End | MessageKind::Reject)
    }
}

/// Payload of an `Init` envelope.
///
/// Carries the initiating flow's class name so the receiving manager can
/// resolve the registered responder constructor — registry dispatch, no
/// reflection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub flow_class: String,
    pub flow_version: u32,
    pub payload: Vec<u8>,
}

/// Stable tag on an outbound message enabling the receiving de-duplicator to
/// drop replays.
///
/// The `(seed, session_ordinal, sequence, retry)` tuple identifies the
/// logical message; `sender_uuid` identifies the process incarnation that
/// produced it and is `None` when a flow is resumed from a checkpoint on a
/// fresh process — such messages must be treated as possibly duplicated
/// downstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeduplicationId {
    pub sender_uuid: Option<Uuid>,
    pub seed: String,
    pub session_ordinal: u64,
    pub sequence: u64,
    pub retry: u32,
}

impl DeduplicationId {
    #[must_use]
    pub fn new(
        sender_uuid: Option<Uuid>,
        seed: impl Into<String>,
        session_ordinal: u64,
        sequence: u64,
        retry: u32,
    ) -> Self {
        Self {
            sender_uuid,
            seed: seed.into(),
            session_ordinal,
            sequence,
            retry,
        }
    }

    /// The replay-stable portion of the id: everything except the sender
    /// incarnation. Two envelopes with equal logical keys are duplicates of
    /// the same message regardless of which process emitted them.
    #[must_use]
    pub fn logical_key(&self) -> (String, u64, u64, u32) {
        (
            self.seed.clone(),
            self.session_ordinal,
            self.sequence,
            self.retry,
        )
    }
}

impl fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.seed, self.session_ordinal, self.sequence
        )?;
        if self.retry > 0 {
            write!(f, "-r{}", self.retry)?;
        }
        match &self.sender_uuid {
            Some(uuid) => write!(f, "@{uuid}"),
            None => write!(f, "@resumed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FlowId;

    #[test]
    fn dedup_id_render_marks_resumed_senders() {
        let flow = FlowId::random();
        let id = DeduplicationId::new(None, flow.to_string(), 0, 0, 0);
        let rendered = id.to_string();
        assert!(rendered.starts_with(&flow.to_string()));
        assert!(rendered.ends_with("@resumed"));
    }

    #[test]
    fn dedup_logical_key_ignores_sender() {
        let fresh = DeduplicationId::new(Some(Uuid::new_v4()), "seed", 1, 7, 0);
        let replay = DeduplicationId::new(None, "seed", 1, 7, 0);
        assert_eq!(fresh.logical_key(), replay.logical_key());
    }

    #[test]
    fn retry_counter_changes_the_rendered_id() {
        let base = DeduplicationId::new(None, "seed", 0, 3, 0);
        let retried = DeduplicationId::new(None, "seed", 0, 3, 1);
        assert_ne!(base.to_string(), retried.to_string());
    }
}
