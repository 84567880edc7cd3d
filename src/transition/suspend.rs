//! Transition rules for the `Suspend` event.
//!
//! A suspension stages its sends, decides whether a durable checkpoint is
//! required, and either parks the flow or — when the awaited payloads are
//! already buffered — resumes it on the spot.

use crate::actions::{Action, Outbound};
use crate::checkpoint::{Checkpoint, FlowState, SessionPhase};
use crate::errors::FlowError;
use crate::events::Event;
use crate::ids::SessionId;
use crate::io::{FlowIoRequest, ResumeValue};
use crate::messages::SessionMessage;
use crate::transition::{
    Continuation, TransitionContext, TransitionResult, dedup_for, pop_buffered, receive_ready,
};

/// Stage the outbound messages a request implies, mutating session phases
/// and sequence counters on `next`. Returns the send actions in
/// session-id order plus dedup watermark updates.
fn stage_sends(
    ctx: &TransitionContext<'_>,
    next: &mut Checkpoint,
    request: &FlowIoRequest,
) -> Result<Vec<Action>, FlowError> {
    let mut actions = Vec::new();
    match request {
        FlowIoRequest::Send { payloads } | FlowIoRequest::SendAndReceive { payloads } => {
            for (session_id, payload) in payloads {
                actions.extend(stage_one_send(ctx, next, *session_id, payload)?);
            }
        }
        FlowIoRequest::CloseSessions { sessions } => {
            let mut ends = Vec::new();
            for session_id in sessions {
                let session =
                    next.sessions
                        .get(session_id)
                        .ok_or(FlowError::UnknownSession {
                            session_id: *session_id,
                        })?;
                if !session.is_open() {
                    continue;
                }
                let dedup = dedup_for(ctx, next, session, session.sequence_watermark());
                let session = next
                    .sessions
                    .get_mut(session_id)
                    .expect("session presence just checked");
                let sequence = session.next_sequence();
                let peer_session_id = match &session.phase {
                    SessionPhase::Initiated {
                        peer_session_id, ..
                    } => Some(*peer_session_id),
                    _ => None,
                };
                ends.push(Outbound {
                    peer: session.peer.clone(),
                    message: SessionMessage::end(
                        session.session_id,
                        peer_session_id,
                        sequence,
                        dedup.to_string(),
                    ),
                });
                session.phase = SessionPhase::Closed;
            }
            if !ends.is_empty() {
                actions.push(Action::SendMultiple { messages: ends });
            }
        }
        _ => {}
    }
    Ok(actions)
}

/// Stage one payload onto one session.
///
/// A session leaves `Uninitiated` only here: the payload rides the `Init`
/// envelope, staged in the same transaction as the checkpoint write.
fn stage_one_send(
    ctx: &TransitionContext<'_>,
    next: &mut Checkpoint,
    session_id: SessionId,
    payload: &[u8],
) -> Result<Vec<Action>, FlowError> {
    let flow_class = next.invocation.flow_class.clone();
    let flow_version = next.invocation.flow_version;
    let session = next
        .sessions
        .get(&session_id)
        .ok_or(FlowError::UnknownSession { session_id })?;

    match &session.phase {
        SessionPhase::Closed => Err(FlowError::ClosedSession { session_id }),
        SessionPhase::Uninitiated => {
            let dedup = dedup_for(ctx, next, session, 0);
            let seed = dedup.seed.clone();
            let peer = session.peer.clone();
            let session = next
                .sessions
                .get_mut(&session_id)
                .expect("session presence just checked");
            session.phase = SessionPhase::Initiating {
                payload: payload.to_vec(),
                dedup_seed: seed,
                sequence: 1,
            };
            Ok(vec![
                Action::SendInitial {
                    session_id,
                    peer,
                    flow_class,
                    flow_version,
                    payload: payload.to_vec(),
                    dedup,
                },
                Action::UpdateDeduplicationId {
                    session_id,
                    sequence: 1,
                },
            ])
        }
        SessionPhase::Initiating { .. } | SessionPhase::Initiated { .. } => {
            let dedup = dedup_for(ctx, next, session, session.sequence_watermark());
            let peer = session.peer.clone();
            let session = next
                .sessions
                .get_mut(&session_id)
                .expect("session presence just checked");
            let sequence = session.next_sequence();
            let peer_session_id = match &session.phase {
                SessionPhase::Initiated {
                    peer_session_id, ..
                } => Some(*peer_session_id),
                _ => None,
            };
            let message = SessionMessage::data(
                session_id,
                peer_session_id,
                sequence,
                dedup.to_string(),
                payload.to_vec(),
            );
            Ok(vec![
                Action::SendExisting { peer, message },
                Action::UpdateDeduplicationId {
                    session_id,
                    sequence: sequence + 1,
                },
            ])
        }
    }
}

/// The `Suspend` rule.
pub(super) fn on_suspend(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
    request: &FlowIoRequest,
    may_skip_checkpoint: bool,
    continuation: &[u8],
) -> Result<TransitionResult, FlowError> {
    if state.flow_state.is_terminal() {
        return Err(FlowError::NotApplicable {
            event: "suspend",
            state: state.flow_state.label(),
        });
    }

    let mut next = state.clone();
    let send_actions = stage_sends(ctx, &mut next, request)?;
    let had_sends = !send_actions.is_empty();

    let force =
        matches!(request, FlowIoRequest::ForceCheckpoint) || next.force_persist_on_next_suspend;
    let skip = !force && (may_skip_checkpoint || next.any_idempotent_frame());

    // Receive short-circuit: everything awaited is already buffered.
    let targets = request.receive_targets();
    if !targets.is_empty() && receive_ready(&next, &targets)? {
        let payloads = pop_buffered(&mut next, &targets);
        next.unpersisted_sends |= had_sends;
        let mut actions = send_actions;
        actions.push(Action::AcknowledgeMessages {
            deduplication_ids: next.take_pending_acks(),
        });
        return Ok(TransitionResult {
            state: next,
            actions,
            continuation: Continuation::Resume(ResumeValue::Messages(payloads)),
        });
    }

    next.flow_state = FlowState::Suspended {
        request: request.clone(),
        continuation: continuation.to_vec(),
    };

    let mut actions = Vec::new();
    if skip {
        actions.extend(send_actions);
        actions.push(Action::AcknowledgeMessages {
            deduplication_ids: next.take_pending_acks(),
        });
        next.unpersisted_sends |= had_sends;
    } else {
        next.suspend_count += 1;
        actions.push(Action::PersistCheckpoint);
        actions.extend(send_actions);
        actions.push(Action::AcknowledgeMessages {
            deduplication_ids: next.take_pending_acks(),
        });
        actions.push(Action::CommitTransaction);
        actions.push(Action::CreateTransaction);
        next.unpersisted_sends = false;
        next.force_persist_on_next_suspend = false;
    }

    match request {
        FlowIoRequest::Sleep { duration } => {
            actions.push(Action::SleepUntil {
                duration: *duration,
            });
        }
        FlowIoRequest::WaitForSessionConfirmations if all_confirmed(&next) => {
            actions.push(Action::ScheduleEvent {
                event: Box::new(Event::DoRemainingWork),
                after: None,
            });
        }
        _ if request.fulfilled_on_suspend() => {
            actions.push(Action::ScheduleEvent {
                event: Box::new(Event::DoRemainingWork),
                after: None,
            });
        }
        _ => {}
    }

    Ok(TransitionResult {
        state: next,
        actions,
        continuation: Continuation::ProcessEvents,
    })
}

/// No session is still waiting for its responder's confirmation.
pub(super) fn all_confirmed(state: &Checkpoint) -> bool {
    !state
        .sessions
        .values()
        .any(|s| matches!(s.phase, SessionPhase::Initiating { .. }))
}
