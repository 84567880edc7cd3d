//! Transition-function tests for inbound session traffic: ordering,
//! multi-session receives, rejection, and protocol errors.

use std::collections::{BTreeSet, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use flowstate::checkpoint::{
    Checkpoint, FlowState, InvocationContext, SessionInfo, SessionPhase, StartOrigin,
};
use flowstate::config::RetryPolicy;
use flowstate::errors::FlowException;
use flowstate::events::Event;
use flowstate::ids::{FlowId, PeerId, SessionId};
use flowstate::io::{FlowIoRequest, ResumeValue};
use flowstate::messages::SessionMessage;
use flowstate::transition::{Continuation, TransitionContext, TransitionResult, transition};

fn unstarted() -> Checkpoint {
    Checkpoint::unstarted(
        FlowId::random(),
        InvocationContext {
            flow_class: "TestFlow".to_string(),
            flow_version: 1,
            origin: StartOrigin::Rpc,
            started_at: Utc::now(),
            start_args: b"{}".to_vec(),
        },
        PeerId::new("O=Alpha,L=Zurich"),
        false,
        false,
    )
}

fn open_session(checkpoint: &mut Checkpoint, ordinal: u64) -> SessionId {
    let session_id = SessionId::derive(checkpoint.flow_id, ordinal);
    checkpoint.sessions.insert(
        session_id,
        SessionInfo {
            session_id,
            ordinal,
            peer: PeerId::new("O=Beta,L=Oslo"),
            phase: SessionPhase::Initiated {
                peer_session_id: session_id,
                end_of_session_seen: false,
                sequence: 0,
            },
            inbound: VecDeque::new(),
            next_inbound_sequence: 0,
        },
    );
    checkpoint.next_session_ordinal = checkpoint.next_session_ordinal.max(ordinal + 1);
    session_id
}

fn parked_on_receive(checkpoint: &mut Checkpoint, sessions: BTreeSet<SessionId>) {
    checkpoint.flow_state = FlowState::Suspended {
        request: FlowIoRequest::Receive { sessions },
        continuation: b"blob".to_vec(),
    };
    checkpoint.suspend_count = 1;
}

fn apply(state: &Checkpoint, event: Event) -> TransitionResult {
    let policy = RetryPolicy::default();
    let ctx = TransitionContext {
        sender_uuid: Some(Uuid::from_u128(11)),
        retry_policy: &policy,
        persisted: None,
    };
    transition(&ctx, state, &event)
}

fn data(session_id: SessionId, sequence: u64, payload: &[u8]) -> Event {
    Event::DeliverSessionMessage {
        session_id,
        message: SessionMessage::data(
            session_id,
            Some(session_id),
            sequence,
            format!("d-{sequence}"),
            payload.to_vec(),
        ),
    }
}

/// S4: a multi-session receive stays parked until every session has a
/// message, then resumes with all of them.
#[test]
fn multi_session_receive_waits_for_all_sessions() {
    let mut state = unstarted();
    let first = open_session(&mut state, 0);
    let second = open_session(&mut state, 1);
    parked_on_receive(&mut state, BTreeSet::from([first, second]));

    let after_first = apply(&state, data(first, 0, b"msg1"));
    assert_eq!(after_first.continuation, Continuation::ProcessEvents);
    assert!(matches!(
        after_first.state.flow_state,
        FlowState::Suspended { .. }
    ));

    let after_second = apply(&after_first.state, data(second, 0, b"msg2"));
    let Continuation::Resume(ResumeValue::Messages(payloads)) = after_second.continuation else {
        panic!("expected a resume once both sessions delivered");
    };
    assert_eq!(payloads[&first], b"msg1".to_vec());
    assert_eq!(payloads[&second], b"msg2".to_vec());
}

#[test]
fn per_session_fifo_order_is_preserved() {
    let mut state = unstarted();
    let session_id = open_session(&mut state, 0);
    parked_on_receive(&mut state, BTreeSet::from([session_id]));

    // First delivery satisfies the park and resumes with the first message.
    let first = apply(&state, data(session_id, 0, b"first"));
    let Continuation::Resume(ResumeValue::Messages(payloads)) = &first.continuation else {
        panic!("expected a resume");
    };
    assert_eq!(payloads[&session_id], b"first".to_vec());

    // The second queues behind it and is served on the next receive.
    let second = apply(&first.state, data(session_id, 1, b"second"));
    assert_eq!(second.continuation, Continuation::ProcessEvents);
    let next_receive = apply(&second.state, Event::DoRemainingWork);
    let Continuation::Resume(ResumeValue::Messages(payloads)) = next_receive.continuation else {
        panic!("expected the buffered message to satisfy the next receive");
    };
    assert_eq!(payloads[&session_id], b"second".to_vec());
}

#[test]
fn replayed_data_is_dropped_not_rebuffered() {
    let mut state = unstarted();
    let session_id = open_session(&mut state, 0);

    let once = apply(&state, data(session_id, 0, b"payload"));
    let twice = apply(&once.state, data(session_id, 0, b"payload"));

    let session = &twice.state.sessions[&session_id];
    assert_eq!(session.inbound.len(), 1);
    // The replay is still acknowledged so the broker stops resending it.
    assert_eq!(twice.state.pending_acks.len(), 2);
}

#[test]
fn confirm_completes_the_handshake_and_wakes_waiters() {
    let mut state = unstarted();
    let session_id = SessionId::derive(state.flow_id, 0);
    state.sessions.insert(
        session_id,
        SessionInfo {
            session_id,
            ordinal: 0,
            peer: PeerId::new("O=Beta,L=Oslo"),
            phase: SessionPhase::Initiating {
                payload: b"ping".to_vec(),
                dedup_seed: state.flow_id.to_string(),
                sequence: 1,
            },
            inbound: VecDeque::new(),
            next_inbound_sequence: 0,
        },
    );
    state.next_session_ordinal = 1;
    state.flow_state = FlowState::Suspended {
        request: FlowIoRequest::WaitForSessionConfirmations,
        continuation: b"blob".to_vec(),
    };

    let confirm = Event::DeliverSessionMessage {
        session_id,
        message: SessionMessage::confirm(session_id, "c-0"),
    };
    let result = apply(&state, confirm);

    assert_eq!(
        result.continuation,
        Continuation::Resume(ResumeValue::Acknowledged)
    );
    assert!(matches!(
        result.state.sessions[&session_id].phase,
        SessionPhase::Initiated { .. }
    ));
}

/// S5: a counterparty rejection surfaces as a thrown flow exception, and if
/// user code leaves it uncaught the flow transitions to errored.
#[test]
fn rejection_throws_the_counterparty_exception() {
    let mut state = unstarted();
    let session_id = open_session(&mut state, 0);
    parked_on_receive(&mut state, BTreeSet::from([session_id]));

    let exception = FlowException::new("NotAuthorised");
    let reject = Event::DeliverSessionMessage {
        session_id,
        message: SessionMessage::reject(
            session_id,
            Some(session_id),
            0,
            "r-0",
            exception.to_payload().unwrap(),
        ),
    };
    let rejected = apply(&state, reject);

    let Continuation::Throw(thrown) = &rejected.continuation else {
        panic!("expected a throw, got {:?}", rejected.continuation);
    };
    assert_eq!(thrown.message, "NotAuthorised");
    assert!(matches!(
        rejected.state.sessions[&session_id].phase,
        SessionPhase::Closed
    ));

    // Uncaught: the worker feeds the exception back as an error event.
    let errored = apply(
        &rejected.state,
        Event::Error {
            error: flowstate::errors::FlowError::User(thrown.clone()),
        },
    );
    assert_eq!(errored.continuation, Continuation::Abort);
    assert!(errored.state.error_state.is_errored());
    assert!(
        errored
            .actions
            .iter()
            .any(|a| a.kind() == "propagate_errors")
    );
}

#[test]
fn end_of_session_during_receive_throws() {
    let mut state = unstarted();
    let session_id = open_session(&mut state, 0);
    parked_on_receive(&mut state, BTreeSet::from([session_id]));

    let end = Event::DeliverSessionMessage {
        session_id,
        message: SessionMessage::end(session_id, Some(session_id), 5, "e-5"),
    };
    let result = apply(&state, end);

    assert!(matches!(result.continuation, Continuation::Throw(_)));
}

#[test]
fn unknown_session_is_an_error() {
    let state = unstarted();
    let bogus = SessionId::from_raw(0xDEAD_BEEF);

    let result = apply(&state, data(bogus, 0, b"stray"));

    assert_eq!(result.continuation, Continuation::Abort);
    assert!(result.state.error_state.is_errored());
}

#[test]
fn duplicate_session_init_is_an_error() {
    let mut state = unstarted();
    let session_id = open_session(&mut state, 0);

    let duplicate = Event::DeliverSessionMessage {
        session_id,
        message: SessionMessage::init(session_id, "i-0", b"{}".to_vec()),
    };
    let result = apply(&state, duplicate);

    assert_eq!(result.continuation, Continuation::Abort);
    assert!(result.state.error_state.is_errored());
}

#[test]
fn cross_session_payloads_arrive_in_insertion_order() {
    let mut state = unstarted();
    let first = open_session(&mut state, 0);
    let second = open_session(&mut state, 1);

    // Buffer out of session-id order; arrival stamps must still reflect
    // delivery order.
    let one = apply(&state, data(second, 0, b"from-second"));
    let two = apply(&one.state, data(first, 0, b"from-first"));

    let arrival_second = two.state.sessions[&second].inbound[0].arrival;
    let arrival_first = two.state.sessions[&first].inbound[0].arrival;
    assert!(arrival_second < arrival_first);
}
