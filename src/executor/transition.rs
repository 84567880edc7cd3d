//! The transition executor: transaction discipline around the pure
//! transition function.
//!
//! Contract:
//! 1. A transaction is open on entry to every transition.
//! 2. `CommitTransaction` commits; `CreateTransaction` reopens at the
//!    suspension boundary.
//! 3. Any failure while applying actions rolls the transaction back,
//!    converts the failure into an `Error` event, and re-enters the
//!    transition function — bounded, so a failing error path cannot spin.
//!
//! Interceptors stack around both the transition and each action; each must
//! preserve the transaction contract of whatever it wraps. The
//! [`FaultInjector`] interceptor is how the crash tests cut the power at a
//! chosen action.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use crate::actions::Action;
use crate::checkpoint::Checkpoint;
use crate::config::RetryPolicy;
use crate::errors::FlowError;
use crate::events::Event;
use crate::executor::action::{ActionEnv, apply};
use crate::executor::txn::FlowTransaction;
use crate::ids::FlowId;
use crate::transition::{Continuation, TransitionContext, transition};

/// How many times a failure may be converted into an `Error` event and
/// re-entered before the worker gives up and aborts the flow.
const MAX_ERROR_CONVERSIONS: u32 = 3;

/// Observes and optionally vetoes transition execution.
pub trait TransitionInterceptor: Send + Sync {
    fn before_transition(&self, _flow_id: FlowId, _event: &Event) {}

    fn after_transition(&self, _flow_id: FlowId, _continuation: &Continuation) {}

    /// Called before each action is applied; returning an error aborts the
    /// action list exactly as if the action itself had failed.
    fn before_action(&self, _flow_id: FlowId, _action: &Action) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Structured logging around every transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl TransitionInterceptor for LoggingInterceptor {
    fn before_transition(&self, flow_id: FlowId, event: &Event) {
        tracing::debug!(flow_id = %flow_id, event = event.kind(), "transition");
    }

    fn after_transition(&self, flow_id: FlowId, continuation: &Continuation) {
        tracing::trace!(flow_id = %flow_id, continuation = ?continuation, "transition complete");
    }
}

/// Test interceptor that fails a bounded number of matching actions —
/// crash injection without reaching into the store.
pub struct FaultInjector {
    action_kind: &'static str,
    remaining: AtomicU32,
    error: FlowError,
}

impl FaultInjector {
    /// Fail the first action whose [`Action::kind`] matches, once.
    #[must_use]
    pub fn once(action_kind: &'static str, error: FlowError) -> Self {
        Self::times(action_kind, 1, error)
    }

    #[must_use]
    pub fn times(action_kind: &'static str, count: u32, error: FlowError) -> Self {
        Self {
            action_kind,
            remaining: AtomicU32::new(count),
            error,
        }
    }
}

impl TransitionInterceptor for FaultInjector {
    fn before_action(&self, flow_id: FlowId, action: &Action) -> Result<(), FlowError> {
        if action.kind() != self.action_kind {
            return Ok(());
        }
        let fired = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fired {
            tracing::debug!(flow_id = %flow_id, action = action.kind(), "injecting fault");
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }
}

pub(crate) struct TransitionExecutor {
    env: ActionEnv,
    retry_policy: RetryPolicy,
    sender_uuid: Option<Uuid>,
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
    /// The last committed checkpoint revision — the safe point retries
    /// reset to.
    persisted_shadow: Option<Checkpoint>,
}

impl TransitionExecutor {
    pub(crate) fn new(
        env: ActionEnv,
        retry_policy: RetryPolicy,
        sender_uuid: Option<Uuid>,
        interceptors: Vec<Arc<dyn TransitionInterceptor>>,
        persisted_shadow: Option<Checkpoint>,
    ) -> Self {
        Self {
            env,
            retry_policy,
            sender_uuid,
            interceptors,
            persisted_shadow,
        }
    }

    pub(crate) fn timeouts(&self) -> crate::gate::FlowTimeouts {
        self.env.timeouts.clone()
    }

    /// Run one event through the transition function and apply its actions.
    ///
    /// `Err` here means the error-conversion bound was exhausted or the
    /// store refused to open a transaction; the worker aborts the flow.
    pub(crate) async fn execute(
        &mut self,
        txn: &mut Option<FlowTransaction>,
        state: &mut Checkpoint,
        event: Event,
    ) -> Result<Continuation, FlowError> {
        let flow_id = self.env.flow_id;
        let mut current = event;
        let mut conversions = 0u32;

        loop {
            // Contract 1: a transaction is open on entry.
            if txn.is_none() {
                *txn = Some(FlowTransaction::begin(&*self.env.store).await?);
            }

            for interceptor in &self.interceptors {
                interceptor.before_transition(flow_id, &current);
            }

            let ctx = TransitionContext {
                sender_uuid: self.sender_uuid,
                retry_policy: &self.retry_policy,
                persisted: self.persisted_shadow.as_ref(),
            };
            let result = transition(&ctx, state, &current);

            match self.apply_all(txn, &result.state, &result.actions).await {
                Ok(()) => {
                    *state = result.state;
                    for interceptor in &self.interceptors {
                        interceptor.after_transition(flow_id, &result.continuation);
                    }
                    return Ok(result.continuation);
                }
                Err(error) => {
                    // Contract 3: rollback, convert, re-enter. The failed
                    // transition's state is discarded along with its staged
                    // effects.
                    if let Some(open) = txn.take() {
                        if let Err(rollback_err) = open.rollback().await {
                            tracing::warn!(
                                flow_id = %flow_id,
                                error = %rollback_err,
                                "rollback failed while handling action error"
                            );
                        }
                    }
                    conversions += 1;
                    if conversions > MAX_ERROR_CONVERSIONS {
                        return Err(error);
                    }
                    current = Event::Error { error };
                }
            }
        }
    }

    async fn apply_all(
        &mut self,
        txn: &mut Option<FlowTransaction>,
        state: &Checkpoint,
        actions: &[Action],
    ) -> Result<(), FlowError> {
        let flow_id = self.env.flow_id;
        let mut checkpoint_staged = false;
        for action in actions {
            for interceptor in &self.interceptors {
                interceptor.before_action(flow_id, action)?;
            }
            apply(&self.env, txn, state, action).await?;
            match action {
                Action::PersistCheckpoint | Action::RemoveCheckpoint => {
                    checkpoint_staged = true;
                }
                Action::CommitTransaction if checkpoint_staged => {
                    self.persisted_shadow = Some(state.clone());
                    checkpoint_staged = false;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
