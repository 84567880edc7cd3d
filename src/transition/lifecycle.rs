//! Transition rules for flow lifecycle: start kicks, sub-flow boundaries,
//! completion, wake-ups, and the small context-command events.

use std::time::Duration;

use crate::actions::{Action, Outbound};
use crate::checkpoint::{Checkpoint, FlowState, SessionPhase, SubFlowFrame};
use crate::errors::FlowError;
use crate::ids::SoftLockId;
use crate::io::{FlowIoRequest, ResumeValue};
use crate::messages::SessionMessage;
use crate::transition::{
    Continuation, TransitionContext, TransitionResult, dedup_for, pop_buffered, receive_ready,
};

/// The `DoRemainingWork` rule: start an unstarted flow, or re-check whether
/// the current suspension is now satisfiable.
pub(super) fn do_remaining_work(state: &Checkpoint) -> Result<TransitionResult, FlowError> {
    match &state.flow_state {
        FlowState::Unstarted => Ok(TransitionResult {
            state: state.clone(),
            actions: vec![Action::SignalFlowHasStarted],
            continuation: Continuation::Resume(ResumeValue::Acknowledged),
        }),
        FlowState::Suspended { request, .. } => {
            if request.fulfilled_on_suspend() {
                return Ok(TransitionResult {
                    state: state.clone(),
                    actions: Vec::new(),
                    continuation: Continuation::Resume(ResumeValue::Acknowledged),
                });
            }
            let targets = request.receive_targets();
            if !targets.is_empty() {
                let mut next = state.clone();
                if receive_ready(&next, &targets)? {
                    let payloads = pop_buffered(&mut next, &targets);
                    return Ok(TransitionResult {
                        state: next,
                        actions: Vec::new(),
                        continuation: Continuation::Resume(ResumeValue::Messages(payloads)),
                    });
                }
                return Ok(TransitionResult::park(state));
            }
            if matches!(request, FlowIoRequest::WaitForSessionConfirmations)
                && super::suspend::all_confirmed(state)
            {
                return Ok(TransitionResult {
                    state: state.clone(),
                    actions: Vec::new(),
                    continuation: Continuation::Resume(ResumeValue::Acknowledged),
                });
            }
            Ok(TransitionResult::park(state))
        }
        _ => Ok(TransitionResult::park(state)),
    }
}

/// The `FlowFinish` rule: tear everything down in one committed batch.
pub(super) fn on_finish(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
    result: &[u8],
    soft_lock_id: Option<SoftLockId>,
) -> Result<TransitionResult, FlowError> {
    if state.flow_state.is_terminal() {
        return Err(FlowError::NotApplicable {
            event: "flow_finish",
            state: state.flow_state.label(),
        });
    }

    let mut next = state.clone();
    next.flow_state = FlowState::Completed {
        result: result.to_vec(),
    };

    // End-of-session fan-out to every still-open session.
    let mut ends = Vec::new();
    let open_ids: Vec<_> = next.open_sessions().map(|s| s.session_id).collect();
    for session_id in open_ids {
        let session = next
            .sessions
            .get(&session_id)
            .expect("open session ids come from the session table");
        let dedup = dedup_for(ctx, &next, session, session.sequence_watermark());
        let session = next
            .sessions
            .get_mut(&session_id)
            .expect("open session ids come from the session table");
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

    let lock_id = soft_lock_id
        .or_else(|| next.soft_locked.then(|| SoftLockId::for_flow(next.flow_id)));

    let mut actions = vec![
        Action::RemoveCheckpoint,
        Action::ReleaseSoftLocks { lock_id },
    ];
    if next.is_timed() {
        actions.push(Action::CancelFlowTimeout);
    }
    actions.push(Action::SendMultiple { messages: ends });
    actions.push(Action::AcknowledgeMessages {
        deduplication_ids: next.take_pending_acks(),
    });
    actions.push(Action::CommitTransaction);

    Ok(TransitionResult {
        state: next,
        actions,
        continuation: Continuation::Abort,
    })
}

/// The `EnterSubFlow` rule.
///
/// Crossing from a non-idempotent frame into an idempotent one marks the
/// next suspension as must-persist: that revision is the safe point the
/// replay-free idempotent stretch falls back to, taken before the child's
/// side effects run.
pub(super) fn enter_sub_flow(
    state: &Checkpoint,
    flow_class: &str,
    version: u32,
    idempotent: bool,
    timed: bool,
) -> Result<TransitionResult, FlowError> {
    if state.flow_state.is_terminal() {
        return Err(FlowError::NotApplicable {
            event: "enter_sub_flow",
            state: state.flow_state.label(),
        });
    }

    let mut next = state.clone();
    let was_idempotent = next.any_idempotent_frame();
    next.sub_flow_stack.push(SubFlowFrame {
        flow_class: flow_class.to_string(),
        version,
        idempotent,
        timed,
    });
    if idempotent && !was_idempotent {
        next.force_persist_on_next_suspend = true;
    }

    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

/// The `LeaveSubFlow` rule.
///
/// Returning from an idempotent stretch that staged sends marks the next
/// suspension as must-persist: from here on replays are no longer free.
pub(super) fn leave_sub_flow(state: &Checkpoint) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    let popped = next
        .sub_flow_stack
        .pop()
        .ok_or(FlowError::SubFlowStackUnderflow)?;

    if popped.idempotent && !next.any_idempotent_frame() && next.unpersisted_sends {
        next.force_persist_on_next_suspend = true;
    }

    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

/// The `AsyncOperationCompletion` rule: resolves `ExecuteAsync` and, when
/// the result names the awaited transaction, `WaitForLedgerCommit`.
pub(super) fn async_completion(
    state: &Checkpoint,
    result: &[u8],
) -> Result<TransitionResult, FlowError> {
    match &state.flow_state {
        FlowState::Suspended {
            request: FlowIoRequest::ExecuteAsync { .. },
            ..
        } => Ok(TransitionResult {
            state: state.clone(),
            actions: Vec::new(),
            continuation: Continuation::Resume(ResumeValue::AsyncResult(result.to_vec())),
        }),
        FlowState::Suspended {
            request: FlowIoRequest::WaitForLedgerCommit { tx_id },
            ..
        } if result == tx_id.as_str().as_bytes() => Ok(TransitionResult {
            state: state.clone(),
            actions: Vec::new(),
            continuation: Continuation::Resume(ResumeValue::LedgerCommitted(tx_id.clone())),
        }),
        // Stale completion for a suspension that already resolved.
        _ => Ok(TransitionResult::park(state)),
    }
}

/// The `WakeUpFromSleep` rule.
pub(super) fn wake_up_from_sleep(state: &Checkpoint) -> Result<TransitionResult, FlowError> {
    match &state.flow_state {
        FlowState::Suspended {
            request: FlowIoRequest::Sleep { .. },
            ..
        } => Ok(TransitionResult {
            state: state.clone(),
            actions: Vec::new(),
            continuation: Continuation::Resume(ResumeValue::Acknowledged),
        }),
        _ => Ok(TransitionResult::park(state)),
    }
}

/// The `UpdateFlowTimeout` rule: remember the timeout and arm the timer.
pub(super) fn update_flow_timeout(
    state: &Checkpoint,
    timeout: Duration,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.wait_timeout = Some(timeout);
    if let Some(frame) = next.sub_flow_stack.last_mut() {
        frame.timed = true;
    }
    Ok(TransitionResult {
        state: next,
        actions: vec![Action::ScheduleFlowTimeout { timeout }],
        continuation: Continuation::ProcessEvents,
    })
}

pub(super) fn record_progress(
    state: &Checkpoint,
    step: &str,
) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.progress = Some(step.to_string());
    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

/// Sticky: only ever flips false→true.
pub(super) fn mark_soft_locked(state: &Checkpoint) -> Result<TransitionResult, FlowError> {
    let mut next = state.clone();
    next.soft_locked = true;
    Ok(TransitionResult {
        state: next,
        actions: Vec::new(),
        continuation: Continuation::ProcessEvents,
    })
}

