//! Transition rules for inbound session traffic and session initiation.

use crate::checkpoint::{BufferedMessage, Checkpoint, FlowState, SessionInfo, SessionPhase};
use crate::errors::{FlowError, FlowException};
use crate::ids::{PeerId, SessionId};
use crate::io::ResumeValue;
use crate::messages::{MessageKind, SessionMessage};
use crate::transition::{Continuation, TransitionResult, pop_buffered, receive_ready};

/// The `DeliverSessionMessage` rule.
pub(super) fn deliver_session_message(
    state: &Checkpoint,
    session_id: SessionId,
    message: &SessionMessage,
) -> Result<TransitionResult, FlowError> {
    if !state.sessions.contains_key(&session_id) {
        return Err(FlowError::UnknownSession { session_id });
    }

    match message.kind {
        MessageKind::Init => Err(FlowError::DuplicateSessionInit { session_id }),
        MessageKind::Confirm => on_confirm(state, session_id, message),
        MessageKind::Data => on_data(state, session_id, message),
        MessageKind::End => on_end(state, session_id, message),
        MessageKind::Reject => on_reject(state, session_id, message),
    }
}

fn on_confirm(
    state: &Checkpoint,
    session_id: SessionId,
    message: &SessionMessage,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.pending_acks.push(message.deduplication_id.clone());
    let session = session_mut(&mut next, session_id)?;
    let confirmed = match &session.phase {
        SessionPhase::Initiating { sequence, .. } => Some(SessionPhase::Initiated {
            peer_session_id: message.peer_session_id.unwrap_or(session_id),
            end_of_session_seen: false,
            sequence: *sequence,
        }),
        // Duplicate confirm from an at-least-once bus: drop it.
        SessionPhase::Initiated { .. } => None,
        SessionPhase::Uninitiated | SessionPhase::Closed => {
            return Err(FlowError::ClosedSession { session_id });
        }
    };
    if let Some(phase) = confirmed {
        session.phase = phase;
    }

    // A flow parked on confirmations wakes once the last one lands.
    if matches!(
        &next.flow_state,
        FlowState::Suspended {
            request: crate::io::FlowIoRequest::WaitForSessionConfirmations,
            ..
        }
    ) && super::suspend::all_confirmed(&next)
    {
        return Ok(TransitionResult {
            state: next,
            actions: Vec::new(),
            continuation: Continuation::Resume(ResumeValue::Acknowledged),
        });
    }

    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

fn on_data(
    state: &Checkpoint,
    session_id: SessionId,
    message: &SessionMessage,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    let arrival = next.arrival_counter;
    next.arrival_counter += 1;
    next.pending_acks.push(message.deduplication_id.clone());

    let session = session_mut(&mut next, session_id)?;
    match &session.phase {
        SessionPhase::Closed => {
            return Err(FlowError::ClosedSession { session_id });
        }
        SessionPhase::Initiated {
            end_of_session_seen: true,
            ..
        } => {
            return Err(FlowError::ClosedSession { session_id });
        }
        _ => {}
    }
    // Replayed delivery from the at-least-once bus: acknowledge, don't
    // buffer twice.
    if message.sequence_number < session.next_inbound_sequence {
        return Ok(TransitionResult {
            state: next,
            actions: Vec::new(),
            continuation: Continuation::ProcessEvents,
        });
    }
    session.next_inbound_sequence = message.sequence_number + 1;
    session.inbound.push_back(BufferedMessage {
        arrival,
        message: message.clone(),
    });

    // If this delivery satisfies the pending receive, resume without a new
    // checkpoint: the suspension is replay-safe either way.
    if let FlowState::Suspended { request, .. } = &next.flow_state {
        let targets = request.receive_targets();
        if targets.contains(&session_id) && receive_ready(&next, &targets)? {
            let payloads = pop_buffered(&mut next, &targets);
            return Ok(TransitionResult {
                state: next,
                actions: Vec::new(),
                continuation: Continuation::Resume(ResumeValue::Messages(payloads)),
            });
        }
    }

    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

fn on_end(
    state: &Checkpoint,
    session_id: SessionId,
    message: &SessionMessage,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.pending_acks.push(message.deduplication_id.clone());
    let session = session_mut(&mut next, session_id)?;
    if let SessionPhase::Initiated {
        end_of_session_seen,
        ..
    } = &mut session.phase
    {
        *end_of_session_seen = true;
    }

    // End-of-session while parked waiting for data on that session is a
    // user-visible failure: the awaited message will never arrive.
    if let FlowState::Suspended { request, .. } = &next.flow_state {
        if request.receive_targets().contains(&session_id) {
            let empty = next
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.inbound.is_empty());
            if empty {
                return Ok(TransitionResult {
                    state: next,
                    actions: Vec::new(),
                    continuation: Continuation::Throw(FlowException::new(format!(
                        "session {session_id} ended by the counterparty before the expected message"
                    ))),
                });
            }
        }
    }

    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

fn on_reject(
    state: &Checkpoint,
    session_id: SessionId,
    message: &SessionMessage,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.pending_acks.push(message.deduplication_id.clone());
    let session = session_mut(&mut next, session_id)?;
    session.phase = SessionPhase::Closed;
    let exception = FlowException::from_payload(&message.payload);
    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::Throw(exception),
    })
}

/// The `InitiateFlow` rule: allocate the next session towards `peer`.
///
/// Checkpoints always persist the session table together with the
/// continuation that created it, so a replayed initiation allocates a fresh
/// ordinal; a collision here means a duplicate, not a replay.
pub(super) fn initiate_session(
    state: &Checkpoint,
    peer: &PeerId,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    let ordinal = next.next_session_ordinal;
    let session_id = SessionId::derive(next.flow_id, ordinal);
    if next.sessions.contains_key(&session_id) {
        return Err(FlowError::DuplicateSessionInit { session_id });
    }
    next.sessions.insert(
        session_id,
        SessionInfo {
            session_id,
            ordinal,
            peer: peer.clone(),
            phase: SessionPhase::Uninitiated,
            inbound: std::collections::VecDeque::new(),
            next_inbound_sequence: 0,
        },
    );
    next.next_session_ordinal += 1;
    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

fn session_mut(
    state: &mut Checkpoint,
    session_id: SessionId,
) -> Result<&mut SessionInfo, FlowError> {
    state
        .sessions
        .get_mut(&session_id)
        .ok_or(FlowError::UnknownSession { session_id })
}
