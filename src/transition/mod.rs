//! The pure transition function: `(state, event) → (state', actions, continuation)`.
//!
//! Purity is the central design decision. Given identical inputs — the
//! [`TransitionContext`] is part of the input — the function produces
//! identical outputs, which buys deterministic replay, property testing
//! without mocks, and a clean split between *deciding* and *doing*. Nothing
//! in this module touches a clock, generates randomness, or performs I/O;
//! timestamps and UUIDs flow in through the state and the context.
//!
//! Rules live in focused submodules:
//!
//! - `suspend` — the `Suspend` event, send staging, receive short-circuit
//! - `deliver` — inbound session messages and session initiation
//! - `lifecycle` — start kicks, sub-flow boundaries, finish, wake-ups
//! - `failure` — error classification, safe-point retry

mod deliver;
mod failure;
mod lifecycle;
mod suspend;

use uuid::Uuid;

use crate::actions::Action;
use crate::checkpoint::{Checkpoint, SessionInfo};
use crate::config::RetryPolicy;
use crate::errors::{FlowError, FlowException};
use crate::events::Event;
use crate::io::ResumeValue;
use crate::messages::DeduplicationId;

/// Per-flow facts the transition function needs beyond the checkpoint.
///
/// `sender_uuid` is this process incarnation's id, and is `None` when the
/// flow was resumed from a checkpoint on a fresh process — outbound dedup
/// ids then mark their messages as possibly duplicated. `persisted` is the
/// last committed checkpoint revision, the safe point a retry resets to.
#[derive(Clone, Copy, Debug)]
pub struct TransitionContext<'a> {
    pub sender_uuid: Option<Uuid>,
    pub retry_policy: &'a RetryPolicy,
    pub persisted: Option<&'a Checkpoint>,
}

/// What the worker should do after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Continuation {
    /// Park and wait for the next event.
    ProcessEvents,
    /// Hand the value back to user code; it runs until its next I/O request.
    Resume(ResumeValue),
    /// Raise the exception inside user code.
    Throw(FlowException),
    /// Terminate the worker and release its resources.
    Abort,
}

/// Output of one transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionResult {
    pub state: Checkpoint,
    /// Applied by the action executor strictly in this order.
    pub actions: Vec<Action>,
    pub continuation: Continuation,
}

impl TransitionResult {
    /// A no-op transition: state unchanged, keep processing events.
    pub(crate) fn park(state: &Checkpoint) -> Self {
        Self {
            state: state.clone(),
            actions: Vec::new(),
            continuation: Continuation::ProcessEvents,
        }
    }
}

/// Apply one event to a flow's state.
///
/// Never fails: rule-level errors are themselves classified and folded into
/// an error transition, exactly as if an [`Event::Error`] had been
/// delivered.
#[must_use]
pub fn transition(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
    event: &Event,
) -> TransitionResult {
    let outcome = match event {
        Event::DoRemainingWork => lifecycle::do_remaining_work(state),
        Event::DeliverSessionMessage {
            session_id,
            message,
        } => deliver::deliver_session_message(state, *session_id, message),
        Event::Error { error } => Ok(failure::on_error(ctx, state, error)),
        Event::Suspend {
            request,
            may_skip_checkpoint,
            continuation,
        } => suspend::on_suspend(ctx, state, request, *may_skip_checkpoint, continuation),
        Event::FlowFinish {
            result,
            soft_lock_id,
        } => lifecycle::on_finish(ctx, state, result, *soft_lock_id),
        Event::EnterSubFlow {
            flow_class,
            version,
            idempotent,
            timed,
        } => lifecycle::enter_sub_flow(state, flow_class, *version, *idempotent, *timed),
        Event::LeaveSubFlow => lifecycle::leave_sub_flow(state),
        Event::InitiateFlow { peer } => deliver::initiate_session(state, peer),
        Event::AsyncOperationCompletion { result } => lifecycle::async_completion(state, result),
        Event::WakeUpFromSleep => lifecycle::wake_up_from_sleep(state),
        Event::RetryFlowFromSafePoint => failure::retry_from_safe_point(ctx, state),
        Event::UpdateFlowTimeout { timeout } => lifecycle::update_flow_timeout(state, *timeout),
        Event::RecordProgress { step } => lifecycle::record_progress(state, step),
        Event::MarkSoftLocked => lifecycle::mark_soft_locked(state),
    };
    outcome.unwrap_or_else(|error| failure::on_error(ctx, state, &error))
}

/// Build the dedup id for an outbound message on `session`.
///
/// Data-path sends always carry `retry: 0`; a replay after a crash restart
/// re-derives the same logical key so the downstream de-duplicator drops
/// it. Only the safe-point retry's re-initiations carry a non-zero retry
/// component.
pub(crate) fn dedup_for(
    ctx: &TransitionContext<'_>,
    state: &Checkpoint,
    session: &SessionInfo,
    sequence: u64,
) -> DeduplicationId {
    DeduplicationId::new(
        ctx.sender_uuid,
        state.flow_id.to_string(),
        session.ordinal,
        sequence,
        0,
    )
}

/// True when every session the request awaits has at least one buffered
/// message.
pub(crate) fn receive_ready(
    state: &Checkpoint,
    targets: &std::collections::BTreeSet<crate::ids::SessionId>,
) -> Result<bool, FlowError> {
    for session_id in targets {
        let session = state
            .sessions
            .get(session_id)
            .ok_or(FlowError::UnknownSession {
                session_id: *session_id,
            })?;
        if matches!(session.phase, crate::checkpoint::SessionPhase::Closed) {
            return Err(FlowError::ClosedSession {
                session_id: *session_id,
            });
        }
        if session.inbound.is_empty() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Pop one buffered message per awaited session, preserving per-session
/// FIFO order. Callers must have checked [`receive_ready`].
pub(crate) fn pop_buffered(
    state: &mut Checkpoint,
    targets: &std::collections::BTreeSet<crate::ids::SessionId>,
) -> std::collections::BTreeMap<crate::ids::SessionId, Vec<u8>> {
    let mut payloads = std::collections::BTreeMap::new();
    for session_id in targets {
        if let Some(session) = state.sessions.get_mut(session_id) {
            if let Some(buffered) = session.inbound.pop_front() {
                payloads.insert(*session_id, buffered.message.payload);
            }
        }
    }
    payloads
}
