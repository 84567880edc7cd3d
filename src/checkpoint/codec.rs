/*!
Checkpoint blob codec.

The persisted form of a checkpoint is a small hand-rolled binary envelope
around opaque serialized sections:

```text
version:u32 LE | flow_id:[u8;16] | suspend_count:u64 LE
| flow_state | sub_flow_stack | sessions | progress | error_state
```

where each section is `len:u32 LE` followed by `len` bytes. The envelope is
fixed; the section bytes are produced by whichever [`CheckpointCodec`] the
host supplies. [`JsonCheckpointCodec`] is the default and serializes each
section with serde_json.

The `progress` section carries the invocation header (flow class, identity,
retry and soft-lock bookkeeping) alongside the progress step; the other
sections map one-to-one onto the checkpoint fields.

Refusing to decode a blob whose version is newer than supported is a fatal
per-flow error: an older node must never guess at a newer layout.

This module performs no I/O. It is pure data transformation and
(de)serialization glue; storage lives in [`super::store`].
*/

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{
    Checkpoint, ErrorState, FlowState, InvocationContext, SessionInfo, SubFlowFrame,
};
use crate::ids::{FlowId, PeerId, SessionId};

/// Newest blob layout this build understands.
pub const SUPPORTED_BLOB_VERSION: u32 = 1;

/// Errors from encoding or decoding checkpoint blobs.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum CodecError {
    /// The blob was written by a newer node than this one.
    #[error("unsupported checkpoint blob version {found} (this node supports up to {supported})")]
    #[diagnostic(
        code(flowstate::codec::unsupported_version),
        help("Upgrade the node before resuming this flow; the checkpoint is intact.")
    )]
    UnsupportedVersion { found: u32, supported: u32 },

    /// The blob ended before the named part could be read.
    #[error("checkpoint blob truncated while reading {part}")]
    #[diagnostic(code(flowstate::codec::truncated))]
    Truncated { part: &'static str },

    /// A section's bytes did not decode.
    #[error("checkpoint section {section} failed to decode: {message}")]
    #[diagnostic(code(flowstate::codec::section))]
    Section {
        section: &'static str,
        message: String,
    },

    /// A section's content failed to serialize.
    #[error("checkpoint serialization failed: {message}")]
    #[diagnostic(code(flowstate::codec::serialize))]
    Serialize { message: String },
}

/// Host-supplied serializer for checkpoint section content.
///
/// The core treats blobs as opaque bytes keyed by the envelope version;
/// implementations must round-trip: `decode(encode(c)) == c` for every
/// checkpoint `c` (modulo the transient fields, which are never persisted).
pub trait CheckpointCodec: Send + Sync {
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, blob: &[u8]) -> Result<Checkpoint, CodecError>;
}

/// Persisted shape of the sessions section.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSessions {
    next_session_ordinal: u64,
    arrival_counter: u64,
    sessions: Vec<SessionInfo>,
}

/// Persisted shape of the progress/header section.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedHeader {
    invocation: InvocationContext,
    our_identity: PeerId,
    retries: u32,
    soft_locked: bool,
    wait_timeout: Option<std::time::Duration>,
    progress: Option<String>,
}

/// Default codec: serde_json section content inside the binary envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCheckpointCodec;

impl JsonCheckpointCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn to_section<T: Serialize>(value: &T, section: &'static str) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
            message: format!("{section}: {e}"),
        })
    }

    fn from_section<T: DeserializeOwned>(
        bytes: &[u8],
        section: &'static str,
    ) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Section {
            section,
            message: e.to_string(),
        })
    }
}

impl CheckpointCodec for JsonCheckpointCodec {
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>, CodecError> {
        let flow_state = Self::to_section(&checkpoint.flow_state, "flow_state")?;
        let sub_flow_stack = Self::to_section(&checkpoint.sub_flow_stack, "sub_flow_stack")?;
        let sessions = Self::to_section(
            &PersistedSessions {
                next_session_ordinal: checkpoint.next_session_ordinal,
                arrival_counter: checkpoint.arrival_counter,
                sessions: checkpoint.sessions.values().cloned().collect(),
            },
            "sessions",
        )?;
        let header = Self::to_section(
            &PersistedHeader {
                invocation: checkpoint.invocation.clone(),
                our_identity: checkpoint.our_identity.clone(),
                retries: checkpoint.retries,
                soft_locked: checkpoint.soft_locked,
                wait_timeout: checkpoint.wait_timeout,
                progress: checkpoint.progress.clone(),
            },
            "progress",
        )?;
        let error_state = Self::to_section(&checkpoint.error_state, "error_state")?;

        let mut blob = Vec::with_capacity(
            4 + 16
                + 8
                + 5 * 4
                + flow_state.len()
                + sub_flow_stack.len()
                + sessions.len()
                + header.len()
                + error_state.len(),
        );
        blob.extend_from_slice(&SUPPORTED_BLOB_VERSION.to_le_bytes());
        blob.extend_from_slice(&checkpoint.flow_id.into_bytes());
        blob.extend_from_slice(&checkpoint.suspend_count.to_le_bytes());
        for section in [&flow_state, &sub_flow_stack, &sessions, &header, &error_state] {
            blob.extend_from_slice(&u32_len(section)?.to_le_bytes());
            blob.extend_from_slice(section);
        }
        Ok(blob)
    }

    fn decode(&self, blob: &[u8]) -> Result<Checkpoint, CodecError> {
        let mut reader = BlobReader::new(blob);
        let version = reader.read_u32("version")?;
        if version > SUPPORTED_BLOB_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_BLOB_VERSION,
            });
        }
        let flow_id = FlowId::from_uuid(Uuid::from_bytes(reader.read_uuid("flow_id")?));
        let suspend_count = reader.read_u64("suspend_count")?;

        let flow_state: FlowState =
            Self::from_section(reader.read_section("flow_state")?, "flow_state")?;
        let sub_flow_stack: Vec<SubFlowFrame> =
            Self::from_section(reader.read_section("sub_flow_stack")?, "sub_flow_stack")?;
        let persisted_sessions: PersistedSessions =
            Self::from_section(reader.read_section("sessions")?, "sessions")?;
        let header: PersistedHeader =
            Self::from_section(reader.read_section("progress")?, "progress")?;
        let error_state: ErrorState =
            Self::from_section(reader.read_section("error_state")?, "error_state")?;

        let sessions = persisted_sessions
            .sessions
            .into_iter()
            .map(|s| (s.session_id, s))
            .collect::<std::collections::BTreeMap<SessionId, SessionInfo>>();

        Ok(Checkpoint {
            flow_id,
            invocation: header.invocation,
            our_identity: header.our_identity,
            sub_flow_stack,
            sessions,
            next_session_ordinal: persisted_sessions.next_session_ordinal,
            arrival_counter: persisted_sessions.arrival_counter,
            flow_state,
            error_state,
            suspend_count,
            retries: header.retries,
            soft_locked: header.soft_locked,
            wait_timeout: header.wait_timeout,
            progress: header.progress,
            pending_acks: Vec::new(),
            unpersisted_sends: false,
            force_persist_on_next_suspend: false,
        })
    }
}

fn u32_len(section: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(section.len()).map_err(|_| CodecError::Serialize {
        message: format!("section of {} bytes exceeds the u32 length prefix", section.len()),
    })
}

/// Cursor over the blob envelope with truncation-aware reads.
struct BlobReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BlobReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize, part: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(CodecError::Truncated { part })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self, part: &'static str) -> Result<u32, CodecError> {
        let bytes = self.take(4, part)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_u64(&mut self, part: &'static str) -> Result<u64, CodecError> {
        let bytes = self.take(8, part)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn read_uuid(&mut self, part: &'static str) -> Result<[u8; 16], CodecError> {
        let bytes = self.take(16, part)?;
        Ok(bytes.try_into().expect("16-byte slice"))
    }

    fn read_section(&mut self, part: &'static str) -> Result<&'a [u8], CodecError> {
        let len = self.read_u32(part)? as usize;
        self.take(len, part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StartOrigin;
    use chrono::Utc;

    fn sample() -> Checkpoint {
        Checkpoint::unstarted(
            FlowId::random(),
            InvocationContext {
                flow_class: "PaymentFlow".into(),
                flow_version: 2,
                origin: StartOrigin::Rpc,
                started_at: Utc::now(),
                start_args: b"{\"amount\":10}".to_vec(),
            },
            PeerId::new("O=Alpha,L=Zurich"),
            false,
            false,
        )
    }

    #[test]
    fn envelope_starts_with_version_and_flow_id() {
        let cp = sample();
        let blob = JsonCheckpointCodec.encode(&cp).unwrap();
        assert_eq!(
            u32::from_le_bytes(blob[0..4].try_into().unwrap()),
            SUPPORTED_BLOB_VERSION
        );
        assert_eq!(&blob[4..20], &cp.flow_id.into_bytes());
    }

    #[test]
    fn newer_versions_are_refused() {
        let cp = sample();
        let mut blob = JsonCheckpointCodec.encode(&cp).unwrap();
        blob[0..4].copy_from_slice(&(SUPPORTED_BLOB_VERSION + 1).to_le_bytes());
        let err = JsonCheckpointCodec.decode(&blob).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { .. }));
    }

    #[test]
    fn truncated_blobs_name_the_missing_part() {
        let cp = sample();
        let blob = JsonCheckpointCodec.encode(&cp).unwrap();
        let err = JsonCheckpointCodec.decode(&blob[..10]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
