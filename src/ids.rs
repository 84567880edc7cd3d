//! Identifier types for the flowstate runtime.
//!
//! This module defines the fundamental identifiers used throughout the system
//! for naming flows, sessions, peers, and ledger transactions. These are the
//! core domain handles everything else is keyed by.
//!
//! # Key Types
//!
//! - [`FlowId`]: Unique identifier of a running flow instance
//! - [`SessionId`]: Identifier of a bidirectional session between two flows
//! - [`PeerId`]: Logical name of a counterparty node
//! - [`TxId`]: Identifier of a ledger transaction a flow may wait on
//!
//! # Examples
//!
//! ```rust
//! use flowstate::ids::{FlowId, SessionId};
//!
//! let flow_id = FlowId::random();
//!
//! // Session ids are derived deterministically from the owning flow and an
//! // ordinal, so replaying a flow from a checkpoint allocates the same ids.
//! let first = SessionId::derive(flow_id, 0);
//! let again = SessionId::derive(flow_id, 0);
//! assert_eq!(first, again);
//! assert_ne!(first, SessionId::derive(flow_id, 1));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a single running flow instance.
///
/// Flow ids are assigned by the [`FlowManager`](crate::manager::FlowManager)
/// when a flow is started and stay stable across suspensions, retries, and
/// process restarts. They key the checkpoint store and the session routing
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Allocate a fresh random flow id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, e.g. one read back from a checkpoint blob.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The raw 16 bytes, as stored in the checkpoint blob envelope.
    #[must_use]
    pub const fn into_bytes(self) -> [u8; 16] {
        self.0.into_bytes()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a session between this flow and a counterparty flow.
///
/// The initiating side allocates the id; the responding side adopts it when
/// it confirms the session, so both ends route by the same value. Allocation
/// is a pure function of `(flow id, ordinal)` — see [`SessionId::derive`] —
/// which lets user code and the pure transition function agree on ids
/// without any shared mutable state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw wire-level session id.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw wire-level value.
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Derive the session id for the `ordinal`-th session opened by `flow_id`.
    ///
    /// Deterministic: replaying a flow from its checkpoint yields the same
    /// ids in the same order.
    #[must_use]
    pub fn derive(flow_id: FlowId, ordinal: u64) -> Self {
        let bits = flow_id.as_uuid().as_u128();
        let hi = (bits >> 64) as u64;
        let lo = bits as u64;
        Self(hi ^ lo.rotate_left(17) ^ ordinal.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical name of a node on the network.
///
/// Identity resolution (certificates, directory lookup) is a collaborator
/// concern; the core treats peers as opaque routable names.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a ledger transaction, as used by
/// [`FlowIoRequest::WaitForLedgerCommit`](crate::io::FlowIoRequest::WaitForLedgerCommit).
///
/// The ledger itself is out of scope; the id is an opaque string handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(String);

impl TxId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a set of soft-locked ledger states held by a flow.
///
/// Conventionally equal to the flow id; released exactly once when the flow
/// reaches a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftLockId(Uuid);

impl SoftLockId {
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The conventional lock id for a flow: its own flow id.
    #[must_use]
    pub const fn for_flow(flow_id: FlowId) -> Self {
        Self(flow_id.as_uuid())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SoftLockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
