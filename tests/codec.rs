//! Checkpoint blob codec round-trips, including a property suite over
//! generated checkpoints.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use flowstate::checkpoint::codec::{CheckpointCodec, JsonCheckpointCodec};
use flowstate::checkpoint::{
    BufferedMessage, Checkpoint, ErrorState, FlowState, InvocationContext, SessionInfo,
    SessionPhase, StartOrigin, SubFlowFrame,
};
use flowstate::errors::FlowException;
use flowstate::ids::{FlowId, PeerId, SessionId};
use flowstate::io::FlowIoRequest;
use flowstate::messages::SessionMessage;

fn rich_checkpoint() -> Checkpoint {
    let flow_id = FlowId::random();
    let mut checkpoint = Checkpoint::unstarted(
        flow_id,
        InvocationContext {
            flow_class: "SettlementFlow".to_string(),
            flow_version: 3,
            origin: StartOrigin::Peer {
                peer: PeerId::new("O=Beta,L=Oslo"),
            },
            started_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            start_args: b"{\"notional\":100}".to_vec(),
        },
        PeerId::new("O=Alpha,L=Zurich"),
        false,
        true,
    );

    checkpoint.sub_flow_stack.push(SubFlowFrame {
        flow_class: "CollectSignatures".to_string(),
        version: 2,
        idempotent: true,
        timed: false,
    });

    let initiating = SessionId::derive(flow_id, 0);
    checkpoint.sessions.insert(
        initiating,
        SessionInfo {
            session_id: initiating,
            ordinal: 0,
            peer: PeerId::new("O=Beta,L=Oslo"),
            phase: SessionPhase::Initiating {
                payload: b"proposal".to_vec(),
                dedup_seed: flow_id.to_string(),
                sequence: 4,
            },
            inbound: VecDeque::new(),
            next_inbound_sequence: 0,
        },
    );
    let established = SessionId::derive(flow_id, 1);
    checkpoint.sessions.insert(
        established,
        SessionInfo {
            session_id: established,
            ordinal: 1,
            peer: PeerId::new("O=Gamma,L=Kyoto"),
            phase: SessionPhase::Initiated {
                peer_session_id: established,
                end_of_session_seen: false,
                sequence: 2,
            },
            inbound: VecDeque::from([BufferedMessage {
                arrival: 7,
                message: SessionMessage::data(
                    established,
                    Some(established),
                    1,
                    "g-1",
                    b"partial-sig".to_vec(),
                ),
            }]),
            next_inbound_sequence: 2,
        },
    );
    checkpoint.next_session_ordinal = 2;
    checkpoint.arrival_counter = 8;
    checkpoint.flow_state = FlowState::Suspended {
        request: FlowIoRequest::WaitForSessionConfirmations,
        continuation: vec![0xAB; 64],
    };
    checkpoint.error_state = ErrorState::Errored {
        errors: vec![FlowException::new("counterparty timed out").with_class("SettlementFlow")],
        hospital_visits: 2,
    };
    checkpoint.suspend_count = 5;
    checkpoint.retries = 1;
    checkpoint.soft_locked = true;
    checkpoint.wait_timeout = Some(Duration::from_secs(30));
    checkpoint.progress = Some("awaiting signatures".to_string());
    checkpoint
}

#[test]
fn rich_checkpoint_roundtrips() {
    let codec = JsonCheckpointCodec::new();
    let original = rich_checkpoint();
    let decoded = codec.decode(&codec.encode(&original).unwrap()).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn transient_fields_never_survive_the_blob() {
    let codec = JsonCheckpointCodec::new();
    let mut original = rich_checkpoint();
    original.pending_acks.push("unacked".to_string());
    original.unpersisted_sends = true;
    original.force_persist_on_next_suspend = true;

    let decoded = codec.decode(&codec.encode(&original).unwrap()).unwrap();
    assert!(decoded.pending_acks.is_empty());
    assert!(!decoded.unpersisted_sends);
    assert!(!decoded.force_persist_on_next_suspend);
}

proptest! {
    /// decode(encode(c)) == c for arbitrary header-ish content.
    #[test]
    fn encode_decode_identity(
        suspend_count in 0u64..1_000_000,
        retries in 0u32..100,
        soft_locked in any::<bool>(),
        progress in proptest::option::of("[a-z ]{0,40}"),
        continuation in proptest::collection::vec(any::<u8>(), 0..256),
        payload in proptest::collection::vec(any::<u8>(), 0..128),
        sequence in 0u64..10_000,
    ) {
        let mut checkpoint = rich_checkpoint();
        checkpoint.suspend_count = suspend_count;
        checkpoint.retries = retries;
        checkpoint.soft_locked = soft_locked;
        checkpoint.progress = progress;
        checkpoint.flow_state = FlowState::Suspended {
            request: FlowIoRequest::ExecuteAsync { handle: "op-1".to_string() },
            continuation,
        };
        let session_id = SessionId::derive(checkpoint.flow_id, 0);
        if let Some(session) = checkpoint.sessions.get_mut(&session_id) {
            session.phase = SessionPhase::Initiating {
                payload,
                dedup_seed: checkpoint.flow_id.to_string(),
                sequence,
            };
        }

        let codec = JsonCheckpointCodec::new();
        let decoded = codec.decode(&codec.encode(&checkpoint).unwrap()).unwrap();
        prop_assert_eq!(decoded, checkpoint);
    }
}
