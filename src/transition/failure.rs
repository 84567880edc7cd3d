//! Transition rules for failure handling and safe-point retry.

use crate::actions::Action;
use crate::checkpoint::{Checkpoint, ErrorState, FlowState, SessionPhase};
use crate::errors::{ErrorClass, FlowError};
use crate::events::Event;
use crate::messages::DeduplicationId;
use crate::transition::{Continuation, TransitionContext, TransitionResult};

/// The `Error` rule. Infallible: the classifier decides, the result says
/// what the executor and worker do about it.
pub(super) fn on_error(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
    error: &FlowError,
) -> TransitionResult {
    match error.class() {
        ErrorClass::Unrecoverable => TransitionResult {
            state: state.clone(),
            actions: vec![Action::HaltProcess],
            continuation: Continuation::Abort,
        },
        ErrorClass::Retryable if !ctx.retry_policy.exhausted(state.retries) => {
            let delay = ctx.retry_policy.backoff(state.retries);
            TransitionResult {
                state: state.clone(),
                actions: vec![
                    Action::RollbackTransaction,
                    Action::CreateTransaction,
                    Action::ScheduleEvent {
                        event: Box::new(Event::RetryFlowFromSafePoint),
                        after: Some(delay),
                    },
                ],
                continuation: Continuation::ProcessEvents,
            }
        }
        // Fatal to the flow, user-visible, or retries exhausted: persist the
        // errored checkpoint for the hospital and tell the counterparties.
        _ => {
            let exception = error.to_exception();
            let mut next = state.clone();
            let hospital_visits = match &next.error_state {
                ErrorState::Errored {
                    hospital_visits, ..
                } => hospital_visits + 1,
                ErrorState::Clean => 1,
            };
            next.error_state = ErrorState::Errored {
                errors: vec![exception.clone()],
                hospital_visits,
            };
            next.flow_state = FlowState::Failed {
                exception: exception.clone(),
            };
            next.suspend_count += 1;
            let mut actions = vec![Action::PersistCheckpoint];
            if next.is_timed() {
                actions.push(Action::CancelFlowTimeout);
            }
            // Terminal abort releases the soft locks, same as finish.
            if next.soft_locked {
                actions.push(Action::ReleaseSoftLocks {
                    lock_id: Some(crate::ids::SoftLockId::for_flow(next.flow_id)),
                });
            }
            actions.push(Action::PropagateErrors {
                errors: vec![exception],
            });
            actions.push(Action::CommitTransaction);
            TransitionResult {
                state: next,
                actions,
                continuation: Continuation::Abort,
            }
        }
    }
}

/// The `RetryFlowFromSafePoint` rule.
///
/// Resets to the last persisted checkpoint: in-memory session buffers and
/// anything staged since are discarded (unacknowledged messages redeliver),
/// in-flight session initiations are re-sent with the same logical sequence
/// number and an incremented retry counter, and the flow is kicked to
/// re-evaluate its suspension. `retries` carries forward — it is the one
/// piece of state a reset never rewinds.
pub(super) fn retry_from_safe_point(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
) -> Result<TransitionResult, FlowError> {
    if state.flow_state.is_terminal() {
        // Raced with completion; nothing to retry.
        return Ok(TransitionResult::park(state));
    }

    let mut next = match ctx.persisted {
        Some(persisted) => persisted.clone(),
        // Nothing durable beyond the unstarted record: rebuild it.
        None => Checkpoint::unstarted(
            state.flow_id,
            state.invocation.clone(),
            state.our_identity.clone(),
            state
                .sub_flow_stack
                .first()
                .is_some_and(|frame| frame.idempotent),
            state
                .sub_flow_stack
                .first()
                .is_some_and(|frame| frame.timed),
        ),
    };
    next.retries = state.retries + 1;
    next.soft_locked = next.soft_locked || state.soft_locked;
    next.wait_timeout = next.wait_timeout.or(state.wait_timeout);
    next.pending_acks.clear();
    next.unpersisted_sends = false;
    next.force_persist_on_next_suspend = false;

    let mut actions = vec![Action::RollbackTransaction, Action::CreateTransaction];

    // Re-initiate sessions whose handshake never completed: same logical
    // sequence, bumped retry counter in the dedup id.
    for session in next.sessions.values() {
        if let SessionPhase::Initiating {
            payload,
            dedup_seed,
            ..
        } = &session.phase
        {
            actions.push(Action::SendInitial {
                session_id: session.session_id,
                peer: session.peer.clone(),
                flow_class: next.invocation.flow_class.clone(),
                flow_version: next.invocation.flow_version,
                payload: payload.clone(),
                dedup: DeduplicationId::new(
                    ctx.sender_uuid,
                    dedup_seed.clone(),
                    session.ordinal,
                    0,
                    next.retries,
                ),
            });
        }
    }

    if next.is_timed() {
        if let Some(timeout) = next.wait_timeout {
            actions.push(Action::ScheduleFlowTimeout { timeout });
        }
    }
    actions.push(Action::ScheduleEvent {
        event: Box::new(Event::DoRemainingWork),
        after: None,
    });

    Ok(TransitionResult {
        state: next,
        actions,
        continuation: Continuation::ProcessEvents,
    })
}
