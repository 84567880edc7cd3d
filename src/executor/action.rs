//! The action executor: performs the side effects a transition decided on.
//!
//! Actions are applied strictly in list order, against the flow's open
//! [`FlowTransaction`]. Failures bubble up to the transition executor,
//! which rolls back and re-enters the transition function with an `Error`
//! event.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::actions::{Action, Outbound};
use crate::bus::MessageBus;
use crate::checkpoint::Checkpoint;
use crate::checkpoint::SessionPhase;
use crate::checkpoint::codec::CheckpointCodec;
use crate::checkpoint::store::CheckpointStore;
use crate::clock::Clock;
use crate::errors::FlowError;
use crate::events::Event;
use crate::executor::FlowTransaction;
use crate::gate::{FlowTimeouts, HaltSignal, StartSignal};
use crate::ids::{FlowId, PeerId};
use crate::messages::{DeduplicationId, InitPayload, SessionMessage};
use crate::monitor::{FlowLifecycleEvent, MonitorSet};

/// Everything an action needs to touch the world.
pub(crate) struct ActionEnv {
    pub(crate) flow_id: FlowId,
    pub(crate) our_identity: PeerId,
    pub(crate) sender_uuid: Option<Uuid>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) codec: Arc<dyn CheckpointCodec>,
    pub(crate) self_sender: flume::Sender<Event>,
    pub(crate) timeouts: FlowTimeouts,
    pub(crate) monitor: MonitorSet,
    pub(crate) started: Arc<StartSignal>,
    pub(crate) halt: HaltSignal,
}

impl ActionEnv {
    fn open<'a>(
        &self,
        txn: &'a mut Option<FlowTransaction>,
    ) -> Result<&'a mut FlowTransaction, FlowError> {
        txn.as_mut().ok_or(FlowError::Internal {
            message: "no transaction open where one is required".to_string(),
        })
    }

    /// Post an event to this flow's own inbox without blocking the worker.
    fn post(&self, event: Event) {
        match self.self_sender.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                let sender = self.self_sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send_async(event).await;
                });
            }
            // Worker is gone; nothing left to wake.
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }

    fn post_after(&self, event: Event, delay: Duration) {
        let sender = self.self_sender.clone();
        let clock = Arc::clone(&self.clock);
        // Jitter spreads retry herds without touching the pure backoff.
        let jitter = delay.mul_f64(rand::rng().random_range(0.0..0.1));
        tokio::spawn(async move {
            clock.sleep(delay + jitter).await;
            let _ = sender.send_async(event).await;
        });
    }
}

/// Apply one action. `state` is the post-transition checkpoint the action
/// list belongs to.
pub(crate) async fn apply(
    env: &ActionEnv,
    txn: &mut Option<FlowTransaction>,
    state: &Checkpoint,
    action: &Action,
) -> Result<(), FlowError> {
    match action {
        Action::PersistCheckpoint => {
            let blob = env.codec.encode(state)?;
            env.open(txn)?.persist(env.flow_id, blob).await?;
            env.monitor.emit(&FlowLifecycleEvent::CheckpointPersisted {
                flow_id: env.flow_id,
                revision: state.suspend_count,
            });
            Ok(())
        }
        Action::RemoveCheckpoint => {
            env.open(txn)?.remove(env.flow_id).await?;
            Ok(())
        }
        Action::SendInitial {
            session_id,
            peer,
            flow_class,
            flow_version,
            payload,
            dedup,
        } => {
            let init = InitPayload {
                flow_class: flow_class.clone(),
                flow_version: *flow_version,
                payload: payload.clone(),
            };
            let bytes = serde_json::to_vec(&init).map_err(|e| FlowError::Internal {
                message: format!("init payload serialization: {e}"),
            })?;
            let message = SessionMessage::init(*session_id, dedup.to_string(), bytes);
            env.bus.send(&env.our_identity, peer, message).await?;
            Ok(())
        }
        Action::SendExisting { peer, message } => {
            env.bus
                .send(&env.our_identity, peer, message.clone())
                .await?;
            Ok(())
        }
        Action::SendMultiple { messages } => {
            for outbound in messages {
                env.bus
                    .send(&env.our_identity, &outbound.peer, outbound.message.clone())
                    .await?;
            }
            Ok(())
        }
        Action::ScheduleEvent { event, after } => {
            match after {
                None => env.post((**event).clone()),
                Some(delay) => env.post_after((**event).clone(), *delay),
            }
            Ok(())
        }
        Action::SleepUntil { duration } => {
            env.post_after(Event::WakeUpFromSleep, *duration);
            Ok(())
        }
        Action::AcknowledgeMessages { deduplication_ids } => {
            if !deduplication_ids.is_empty() {
                env.open(txn)?.stage_acks(deduplication_ids.clone());
            }
            Ok(())
        }
        Action::PropagateErrors { errors } => {
            let Some(exception) = errors.first() else {
                return Ok(());
            };
            let payload = exception.to_payload()?;
            let rejects: Vec<Outbound> = state
                .open_sessions()
                .map(|session| {
                    let peer_session_id = match &session.phase {
                        SessionPhase::Initiated {
                            peer_session_id, ..
                        } => Some(*peer_session_id),
                        _ => None,
                    };
                    let dedup = DeduplicationId::new(
                        env.sender_uuid,
                        state.flow_id.to_string(),
                        session.ordinal,
                        session.sequence_watermark(),
                        state.retries,
                    );
                    Outbound {
                        peer: session.peer.clone(),
                        message: SessionMessage::reject(
                            session.session_id,
                            peer_session_id,
                            session.sequence_watermark(),
                            dedup.to_string(),
                            payload.clone(),
                        ),
                    }
                })
                .collect();
            for reject in rejects {
                env.bus
                    .send(&env.our_identity, &reject.peer, reject.message)
                    .await?;
            }
            Ok(())
        }
        Action::CreateTransaction => {
            if txn.is_some() {
                return Err(FlowError::Internal {
                    message: "transaction already open at create".to_string(),
                });
            }
            *txn = Some(FlowTransaction::begin(&*env.store).await?);
            Ok(())
        }
        Action::CommitTransaction => {
            let open = txn.take().ok_or(FlowError::Internal {
                message: "no transaction open at commit".to_string(),
            })?;
            open.commit(&env.our_identity, &*env.bus).await
        }
        Action::RollbackTransaction => {
            if let Some(open) = txn.take() {
                open.rollback().await?;
            }
            Ok(())
        }
        Action::ReleaseSoftLocks { lock_id } => {
            if let Some(lock_id) = lock_id {
                tracing::debug!(flow_id = %env.flow_id, lock_id = %lock_id, "releasing soft locks");
                env.monitor.emit(&FlowLifecycleEvent::SoftLocksReleased {
                    flow_id: env.flow_id,
                });
            }
            Ok(())
        }
        Action::SignalFlowHasStarted => {
            env.started.fire();
            env.monitor.emit(&FlowLifecycleEvent::Started {
                flow_id: env.flow_id,
            });
            Ok(())
        }
        Action::ScheduleFlowTimeout { timeout } => {
            env.timeouts.arm(
                env.flow_id,
                *timeout,
                env.self_sender.clone(),
                Arc::clone(&env.clock),
            );
            Ok(())
        }
        Action::CancelFlowTimeout => {
            env.timeouts.cancel(env.flow_id);
            Ok(())
        }
        Action::UpdateDeduplicationId {
            session_id,
            sequence,
        } => {
            env.open(txn)?
                .record_dedup_watermark(env.flow_id, *session_id, *sequence)
                .await?;
            Ok(())
        }
        Action::HaltProcess => {
            tracing::error!(
                flow_id = %env.flow_id,
                "unrecoverable runtime error, halting process"
            );
            env.halt.trigger();
            Ok(())
        }
    }
}
