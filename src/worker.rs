//! The per-flow worker: one logical event loop per live flow.
//!
//! A worker owns its flow's bounded inbox (single consumer, many
//! producers), the transient in-memory shadow of the persisted checkpoint,
//! and the user logic object. Only one event is ever being processed for a
//! given flow — the central concurrency invariant — while many workers
//! multiplex onto the tokio thread pool.
//!
//! When user code hits an I/O request the worker serializes the
//! continuation and feeds a `Suspend` event through the transition executor
//! *synchronously*, on the same logical turn, so the checkpoint write
//! commits atomically with the suspension's sends.

use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{oneshot, watch};

use crate::checkpoint::{Checkpoint, FlowState};
use crate::errors::{FlowError, FlowException};
use crate::events::Event;
use crate::executor::{FlowTransaction, TransitionExecutor};
use crate::flow::{FlowContext, FlowLogic, FlowPoll, ResumeInput};
use crate::gate::GateGuard;
use crate::hospital::Hospital;
use crate::ids::{FlowId, SessionId, SoftLockId};
use crate::monitor::{FlowLifecycleEvent, MonitorSet};
use crate::registry::FlowRegistry;
use crate::transition::Continuation;

/// Result a flow hands to its completion future.
pub type FlowResult = Result<Vec<u8>, FlowException>;

enum StepOutcome {
    Continue,
    Abort,
}

pub(crate) struct FlowWorker {
    pub(crate) flow_id: FlowId,
    pub(crate) state: Checkpoint,
    pub(crate) logic: Option<Box<dyn FlowLogic>>,
    pub(crate) user_started: bool,
    pub(crate) inbox: flume::Receiver<Event>,
    pub(crate) txn: Option<FlowTransaction>,
    pub(crate) executor: TransitionExecutor,
    pub(crate) registry: FlowRegistry,
    pub(crate) hospital: Arc<dyn Hospital>,
    pub(crate) monitor: MonitorSet,
    pub(crate) completion: Option<oneshot::Sender<FlowResult>>,
    pub(crate) flows: Arc<RwLock<FxHashMap<FlowId, crate::manager::FlowEntry>>>,
    pub(crate) routes: Arc<RwLock<FxHashMap<SessionId, FlowId>>>,
    pub(crate) gate_guard: GateGuard,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) last_error: Option<FlowError>,
}

impl FlowWorker {
    pub(crate) async fn run(mut self) {
        loop {
            let event = tokio::select! {
                event = self.inbox.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = self.shutdown.changed() => break,
            };
            match self.step(event).await {
                StepOutcome::Continue => {}
                StepOutcome::Abort => break,
            }
        }
        self.finalize().await;
    }

    #[tracing::instrument(skip(self, event), fields(flow_id = %self.flow_id, event = event.kind()))]
    async fn step(&mut self, event: Event) -> StepOutcome {
        let is_retry = matches!(event, Event::RetryFlowFromSafePoint);
        if let Event::Error { error } = &event {
            self.last_error = Some(error.clone());
        }

        let continuation = match self
            .executor
            .execute(&mut self.txn, &mut self.state, event)
            .await
        {
            Ok(continuation) => continuation,
            Err(error) => {
                tracing::error!(flow_id = %self.flow_id, error = %error, "executor gave up");
                self.last_error = Some(error);
                return StepOutcome::Abort;
            }
        };

        if is_retry && continuation == Continuation::ProcessEvents {
            // The in-memory logic no longer matches the reset state; it is
            // rebuilt from the checkpoint on the next resume.
            self.logic = None;
            self.user_started = !matches!(self.state.flow_state, FlowState::Unstarted);
            self.monitor.emit(&FlowLifecycleEvent::Retried {
                flow_id: self.flow_id,
                attempt: self.state.retries,
            });
        }

        self.follow(continuation).await
    }

    /// Chase a continuation until the flow parks or terminates, driving
    /// user code as many polls as it takes.
    async fn follow(&mut self, mut continuation: Continuation) -> StepOutcome {
        loop {
            let input = match continuation {
                Continuation::ProcessEvents => {
                    self.sync_routes();
                    return StepOutcome::Continue;
                }
                Continuation::Abort => return StepOutcome::Abort,
                Continuation::Resume(value) => {
                    if self.user_started {
                        ResumeInput::Value(value)
                    } else {
                        self.user_started = true;
                        ResumeInput::Start
                    }
                }
                Continuation::Throw(exception) => ResumeInput::Failed(exception),
            };
            continuation = match self.drive_user(input).await {
                Ok(continuation) => continuation,
                Err(error) => {
                    self.last_error = Some(error);
                    return StepOutcome::Abort;
                }
            };
        }
    }

    /// One poll of user code, then its recorded commands and resulting
    /// suspension or completion, each fed through the transition executor.
    async fn drive_user(&mut self, input: ResumeInput) -> Result<Continuation, FlowError> {
        if self.logic.is_none() {
            match self.restore_logic() {
                Ok(logic) => self.logic = Some(logic),
                Err(error) => return self.exec(Event::Error { error }).await,
            }
        }

        let sessions = self
            .state
            .sessions
            .values()
            .map(|s| (s.session_id, s.peer.clone()))
            .collect();
        let mut ctx = FlowContext::new(
            self.flow_id,
            self.state.our_identity.clone(),
            self.state.next_session_ordinal,
            sessions,
        );
        let mut logic = self.logic.take().expect("logic restored above");
        let poll = logic.resume(&mut ctx, input);
        let commands = ctx.take_commands();
        self.logic = Some(logic);

        for command in commands {
            match self.exec(command.into_event()).await? {
                Continuation::Abort => return Ok(Continuation::Abort),
                // Context commands never resume or throw by construction.
                _ => {}
            }
        }
        // New sessions must be routable before their Init envelopes go out
        // with the next commit.
        self.sync_routes();

        match poll {
            Ok(FlowPoll::Suspend {
                request,
                may_skip_checkpoint,
            }) => {
                let request_kind = request.kind();
                let blob = match self.logic.as_ref().expect("logic present").continuation() {
                    Ok(blob) => blob,
                    Err(error) => {
                        return self
                            .exec(Event::Error {
                                error: error.into(),
                            })
                            .await;
                    }
                };
                let continuation = self
                    .exec(Event::Suspend {
                        request,
                        may_skip_checkpoint,
                        continuation: blob,
                    })
                    .await?;
                if continuation == Continuation::ProcessEvents {
                    self.monitor.emit(&FlowLifecycleEvent::Suspended {
                        flow_id: self.flow_id,
                        request: request_kind.to_string(),
                        suspend_count: self.state.suspend_count,
                    });
                }
                Ok(continuation)
            }
            Ok(FlowPoll::Finished { result }) => {
                let soft_lock_id = self
                    .state
                    .soft_locked
                    .then(|| SoftLockId::for_flow(self.flow_id));
                self.exec(Event::FlowFinish {
                    result,
                    soft_lock_id,
                })
                .await
            }
            Err(exception) => {
                self.exec(Event::Error {
                    error: FlowError::User(exception),
                })
                .await
            }
        }
    }

    async fn exec(&mut self, event: Event) -> Result<Continuation, FlowError> {
        if let Event::Error { error } = &event {
            self.last_error = Some(error.clone());
        }
        self.executor
            .execute(&mut self.txn, &mut self.state, event)
            .await
    }

    fn restore_logic(&self) -> Result<Box<dyn FlowLogic>, FlowError> {
        match &self.state.flow_state {
            FlowState::Unstarted => {
                let spec = self
                    .registry
                    .spec(&self.state.invocation.flow_class)
                    .map_err(|e| FlowError::Internal {
                        message: e.to_string(),
                    })?;
                (spec.construct)(&self.state.invocation.start_args).map_err(FlowError::from)
            }
            FlowState::Suspended { continuation, .. } => self
                .registry
                .restore(&self.state.invocation.flow_class, continuation)
                .map_err(FlowError::from),
            terminal => Err(FlowError::NotApplicable {
                event: "resume",
                state: terminal.label(),
            }),
        }
    }

    /// Keep the manager's session routing table aligned with this flow's
    /// session table: register new sessions, drop ones a retry discarded.
    fn sync_routes(&self) {
        if let Ok(mut routes) = self.routes.write() {
            routes.retain(|session_id, flow_id| {
                *flow_id != self.flow_id || self.state.sessions.contains_key(session_id)
            });
            for session_id in self.state.sessions.keys() {
                routes.entry(*session_id).or_insert(self.flow_id);
            }
        }
    }

    async fn finalize(mut self) {
        if let Some(open) = self.txn.take() {
            let _ = open.rollback().await;
        }
        self.executor.timeouts().cancel(self.flow_id);

        if let Ok(mut flows) = self.flows.write() {
            flows.remove(&self.flow_id);
        }
        if let Ok(mut routes) = self.routes.write() {
            routes.retain(|_, flow_id| *flow_id != self.flow_id);
        }

        match &self.state.flow_state {
            FlowState::Completed { result } => {
                if let Some(completion) = self.completion.take() {
                    let _ = completion.send(Ok(result.clone()));
                }
                self.monitor.emit(&FlowLifecycleEvent::Finished {
                    flow_id: self.flow_id,
                    outcome: "completed".to_string(),
                });
            }
            FlowState::Failed { exception } => {
                if let Some(completion) = self.completion.take() {
                    let _ = completion.send(Err(exception.clone()));
                }
                self.monitor.emit(&FlowLifecycleEvent::Errored {
                    flow_id: self.flow_id,
                    message: exception.message.clone(),
                });
                self.monitor.emit(&FlowLifecycleEvent::Finished {
                    flow_id: self.flow_id,
                    outcome: "failed".to_string(),
                });
                let reason = self
                    .last_error
                    .take()
                    .unwrap_or_else(|| FlowError::User(exception.clone()));
                self.hospital
                    .admit(self.flow_id, reason, self.state.view())
                    .await;
            }
            // Shut down mid-flight: the checkpoint stays put and the flow
            // resumes on restart. The completion future is dropped, which
            // its holder observes as a closed channel.
            _ => {
                self.monitor.emit(&FlowLifecycleEvent::Finished {
                    flow_id: self.flow_id,
                    outcome: "parked".to_string(),
                });
            }
        }

        self.gate_guard.complete();
    }
}
