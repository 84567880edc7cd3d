//! The flow manager: registration, start, resume, kill, and routing.
//!
//! The manager owns the `FlowId → worker` and `SessionId → FlowId` tables,
//! subscribes to the message bus, and reconstructs workers from the
//! checkpoint store at startup. A start request pushes an `Unstarted`
//! checkpoint before any user code runs, so a crash before the first
//! suspension still leaves a replayable record.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowstate::manager::FlowManager;
//! use flowstate::registry::FlowRegistry;
//!
//! # async fn example(registry: FlowRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = FlowManager::builder("O=Alpha,L=Zurich".into(), registry)
//!     .build()
//!     .await?;
//!
//! let resumed = manager.restore().await?;
//! tracing::info!(count = resumed.len(), "resumed flows from checkpoints");
//!
//! let handle = manager.start_flow("PaymentFlow", b"{\"amount\":10}".to_vec()).await?;
//! let result = handle.result().await;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::bus::{BusError, InProcessBus, InboundHandler, MessageBus};
use crate::checkpoint::codec::{CheckpointCodec, CodecError, JsonCheckpointCodec};
use crate::checkpoint::store::{CheckpointStore, InMemoryCheckpointStore, StoreError};
use crate::checkpoint::{
    BufferedMessage, Checkpoint, CheckpointView, FlowState, InvocationContext, SessionInfo,
    SessionPhase, StartOrigin,
};
use crate::clock::{Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::errors::{FlowError, FlowException};
use crate::events::Event;
use crate::executor::{
    ActionEnv, FlowTransaction, LoggingInterceptor, TransitionExecutor, TransitionInterceptor,
};
use crate::flow::FlowLogic;
use crate::gate::{FlowGate, FlowTimeouts, HaltSignal, StartSignal};
use crate::hospital::{Hospital, TracingHospital};
use crate::ids::{FlowId, PeerId, SessionId};
use crate::messages::{DeduplicationId, InitPayload, MessageKind, SessionMessage};
use crate::monitor::{MonitorSet, TracingMonitor};
use crate::registry::{FlowRegistry, RegistryError};
use crate::worker::{FlowResult, FlowWorker};

/// Start arguments handed to responder constructors: the initiating
/// payload arrives through the responder's first receive instead.
const RESPONDER_ARGS: &[u8] = b"{}";

/// Errors from manager operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bus(#[from] BusError),

    #[error("no live or persisted flow {flow_id}")]
    #[diagnostic(code(flowstate::manager::flow_not_found))]
    FlowNotFound { flow_id: FlowId },

    #[error("flow {flow_id} is no longer accepting events")]
    #[diagnostic(code(flowstate::manager::inbox_closed))]
    InboxClosed { flow_id: FlowId },
}

/// A live flow's entry in the manager's table.
pub(crate) struct FlowEntry {
    pub(crate) sender: flume::Sender<Event>,
}

/// Handle returned by [`FlowManager::start_flow`].
pub struct FlowHandle {
    pub flow_id: FlowId,
    started: oneshot::Receiver<()>,
    completion: oneshot::Receiver<FlowResult>,
}

impl FlowHandle {
    /// Resolves once the flow's initial checkpoint is durable and user code
    /// is about to run. Returns `false` if the runtime shut down first.
    pub async fn wait_until_started(&mut self) -> bool {
        (&mut self.started).await.is_ok()
    }

    /// The flow's completion future.
    pub async fn result(self) -> FlowResult {
        self.completion.await.unwrap_or_else(|_| {
            Err(FlowException::new(
                "flow runtime shut down before completion",
            ))
        })
    }
}

/// Builder for a [`FlowManager`].
pub struct FlowManagerBuilder {
    our_identity: PeerId,
    registry: FlowRegistry,
    config: RuntimeConfig,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    hospital: Arc<dyn Hospital>,
    codec: Arc<dyn CheckpointCodec>,
    monitor: MonitorSet,
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
}

impl FlowManagerBuilder {
    fn new(our_identity: PeerId, registry: FlowRegistry) -> Self {
        Self {
            our_identity,
            registry,
            config: RuntimeConfig::default(),
            store: Arc::new(InMemoryCheckpointStore::new()),
            bus: Arc::new(InProcessBus::new()),
            clock: Arc::new(SystemClock::new()),
            hospital: Arc::new(TracingHospital),
            codec: Arc::new(JsonCheckpointCodec::new()),
            monitor: MonitorSet::new().with_sink(TracingMonitor),
            interceptors: vec![Arc::new(LoggingInterceptor)],
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_hospital(mut self, hospital: Arc<dyn Hospital>) -> Self {
        self.hospital = hospital;
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn CheckpointCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorSet) -> Self {
        self.monitor = monitor;
        self
    }

    /// Stack an interceptor around every flow's transition execution.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn TransitionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Finish the build and attach the manager to the bus.
    pub async fn build(self) -> Result<FlowManager, ManagerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(ManagerShared {
            our_identity: self.our_identity.clone(),
            instance_id: Uuid::new_v4(),
            registry: self.registry,
            config: self.config,
            store: self.store,
            bus: self.bus,
            clock: self.clock,
            hospital: self.hospital,
            codec: self.codec,
            monitor: self.monitor,
            interceptors: self.interceptors,
            flows: Arc::new(RwLock::new(FxHashMap::default())),
            routes: Arc::new(RwLock::new(FxHashMap::default())),
            timeouts: FlowTimeouts::default(),
            gate: Arc::new(FlowGate::default()),
            halt: HaltSignal::new(),
            shutdown_tx,
            shutdown_rx,
        });
        let handler = Arc::new(ManagerInbound {
            shared: Arc::downgrade(&shared),
        });
        shared
            .bus
            .subscribe(self.our_identity, handler)
            .await?;
        Ok(FlowManager { shared })
    }
}

struct ManagerShared {
    our_identity: PeerId,
    /// This process incarnation's sender UUID.
    instance_id: Uuid,
    registry: FlowRegistry,
    config: RuntimeConfig,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    hospital: Arc<dyn Hospital>,
    codec: Arc<dyn CheckpointCodec>,
    monitor: MonitorSet,
    interceptors: Vec<Arc<dyn TransitionInterceptor>>,
    flows: Arc<RwLock<FxHashMap<FlowId, FlowEntry>>>,
    routes: Arc<RwLock<FxHashMap<SessionId, FlowId>>>,
    timeouts: FlowTimeouts,
    gate: Arc<FlowGate>,
    halt: HaltSignal,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ManagerShared {
    /// Wire up and launch a worker for `state`. `sender_uuid` is `None`
    /// when the flow is resumed from a checkpoint on a fresh process.
    fn spawn_worker(
        self: &Arc<Self>,
        state: Checkpoint,
        logic: Option<Box<dyn FlowLogic>>,
        sender_uuid: Option<Uuid>,
        persisted_shadow: Option<Checkpoint>,
    ) -> (
        flume::Sender<Event>,
        oneshot::Receiver<()>,
        oneshot::Receiver<FlowResult>,
    ) {
        let flow_id = state.flow_id;
        let (sender, inbox) = flume::bounded(self.config.inbox_capacity);
        let (started_tx, started_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        let env = ActionEnv {
            flow_id,
            our_identity: self.our_identity.clone(),
            sender_uuid,
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            clock: Arc::clone(&self.clock),
            codec: Arc::clone(&self.codec),
            self_sender: sender.clone(),
            timeouts: self.timeouts.clone(),
            monitor: self.monitor.clone(),
            started: Arc::new(StartSignal::new(started_tx)),
            halt: self.halt.clone(),
        };
        let executor = TransitionExecutor::new(
            env,
            self.config.retry,
            sender_uuid,
            self.interceptors.clone(),
            persisted_shadow,
        );

        if let Ok(mut routes) = self.routes.write() {
            for session_id in state.sessions.keys() {
                routes.insert(*session_id, flow_id);
            }
        }

        let user_started = !matches!(state.flow_state, FlowState::Unstarted);
        let worker = FlowWorker {
            flow_id,
            state,
            logic,
            user_started,
            inbox,
            txn: None,
            executor,
            registry: self.registry.clone(),
            hospital: Arc::clone(&self.hospital),
            monitor: self.monitor.clone(),
            completion: Some(completion_tx),
            flows: Arc::clone(&self.flows),
            routes: Arc::clone(&self.routes),
            gate_guard: self.gate.register(),
            shutdown: self.shutdown_rx.clone(),
            last_error: None,
        };

        if let Ok(mut flows) = self.flows.write() {
            flows.insert(
                flow_id,
                FlowEntry {
                    sender: sender.clone(),
                },
            );
        }
        tokio::spawn(worker.run());
        (sender, started_rx, completion_rx)
    }

    fn entry_sender(&self, flow_id: FlowId) -> Result<flume::Sender<Event>, ManagerError> {
        self.flows
            .read()
            .ok()
            .and_then(|flows| flows.get(&flow_id).map(|entry| entry.sender.clone()))
            .ok_or(ManagerError::FlowNotFound { flow_id })
    }

    /// Send a manager-level `Reject` straight through the bus, outside any
    /// flow transaction.
    async fn reject_init(&self, peer: &PeerId, session_id: SessionId, message: &str) {
        let exception = FlowException::new(message);
        let Ok(payload) = exception.to_payload() else {
            return;
        };
        let dedup = DeduplicationId::new(
            Some(self.instance_id),
            format!("init-reject-{session_id}"),
            0,
            0,
            0,
        );
        let reject = SessionMessage::reject(session_id, None, 0, dedup.to_string(), payload);
        if let Err(error) = self.bus.send(&self.our_identity, peer, reject).await {
            tracing::warn!(peer = %peer, error = %error, "failed to send init rejection");
        }
    }

    /// Start a responder flow for an inbound session initiation.
    async fn on_session_init(self: &Arc<Self>, from: PeerId, message: SessionMessage) {
        let session_id = message.session_id;

        let already_routed = self
            .routes
            .read()
            .map(|routes| routes.contains_key(&session_id))
            .unwrap_or(false);
        if already_routed {
            // Redelivered init: our confirmation may have been lost, so
            // repeat it. The initiator drops duplicate confirms.
            tracing::debug!(session_id = %session_id, "duplicate session init, re-confirming");
            let confirm_dedup = DeduplicationId::new(
                Some(self.instance_id),
                format!("confirm-{session_id}"),
                0,
                0,
                0,
            );
            let confirm = SessionMessage::confirm(session_id, confirm_dedup.to_string());
            if let Err(error) = self.bus.send(&self.our_identity, &from, confirm).await {
                tracing::warn!(peer = %from, error = %error, "re-confirm failed");
            }
            return;
        }

        let init: InitPayload = match serde_json::from_slice(&message.payload) {
            Ok(init) => init,
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "undecodable init");
                self.reject_init(&from, session_id, "undecodable session initiation")
                    .await;
                return;
            }
        };
        let spec = match self.registry.responder_for(&init.flow_class) {
            Ok(spec) => spec.clone(),
            Err(error) => {
                tracing::warn!(flow_class = %init.flow_class, "no responder registered");
                self.reject_init(&from, session_id, &error.to_string()).await;
                return;
            }
        };
        if init.flow_version != spec.version {
            self.reject_init(
                &from,
                session_id,
                &format!(
                    "protocol version mismatch: ours {}, theirs {}",
                    spec.version, init.flow_version
                ),
            )
            .await;
            return;
        }
        let logic = match (spec.construct)(RESPONDER_ARGS) {
            Ok(logic) => logic,
            Err(error) => {
                tracing::error!(flow_class = %spec.name, error = %error, "responder construction failed");
                self.reject_init(&from, session_id, "responder construction failed")
                    .await;
                return;
            }
        };

        let flow_id = FlowId::random();
        let invocation = InvocationContext {
            flow_class: spec.name.clone(),
            flow_version: spec.version,
            origin: StartOrigin::Peer { peer: from.clone() },
            started_at: self.clock.now(),
            start_args: RESPONDER_ARGS.to_vec(),
        };
        let mut checkpoint = Checkpoint::unstarted(
            flow_id,
            invocation,
            self.our_identity.clone(),
            spec.idempotent,
            spec.timed,
        );

        // Adopt the initiator's session id; the payload that rode the Init
        // envelope becomes the responder's first receivable message.
        let first = BufferedMessage {
            arrival: 0,
            message: SessionMessage::data(
                session_id,
                Some(session_id),
                0,
                message.deduplication_id.clone(),
                init.payload,
            ),
        };
        checkpoint.sessions.insert(
            session_id,
            SessionInfo {
                session_id,
                ordinal: 0,
                peer: from.clone(),
                phase: SessionPhase::Initiated {
                    peer_session_id: session_id,
                    end_of_session_seen: false,
                    sequence: 0,
                },
                inbound: VecDeque::from([first]),
                next_inbound_sequence: 1,
            },
        );
        checkpoint.next_session_ordinal = 1;
        checkpoint.arrival_counter = 1;

        // The responder's checkpoint and the init acknowledgement commit
        // together; the confirmation follows, covered by init redelivery if
        // it is lost.
        let result: Result<(), ManagerError> = async {
            let blob = self.codec.encode(&checkpoint)?;
            let mut txn = FlowTransaction::begin(&*self.store).await?;
            txn.persist(flow_id, blob).await?;
            txn.stage_acks(vec![message.deduplication_id.clone()]);
            txn.commit(&self.our_identity, &*self.bus)
                .await
                .map_err(|e| match e {
                    FlowError::Store(store) => ManagerError::Store(store),
                    other => ManagerError::Bus(BusError::Backend {
                        message: other.to_string(),
                    }),
                })?;
            let confirm_dedup =
                DeduplicationId::new(Some(self.instance_id), flow_id.to_string(), 0, 0, 0);
            self.bus
                .send(
                    &self.our_identity,
                    &from,
                    SessionMessage::confirm(session_id, confirm_dedup.to_string()),
                )
                .await?;
            Ok(())
        }
        .await;
        if let Err(error) = result {
            tracing::error!(flow_id = %flow_id, error = %error, "responder start failed");
            self.reject_init(&from, session_id, "responder start failed")
                .await;
            return;
        }

        let (sender, _started, _completion) = self.spawn_worker(
            checkpoint.clone(),
            Some(logic),
            Some(self.instance_id),
            Some(checkpoint),
        );
        if sender.send_async(Event::DoRemainingWork).await.is_err() {
            tracing::error!(flow_id = %flow_id, "responder worker exited before its first event");
        }
    }

    async fn dispatch(self: &Arc<Self>, from: PeerId, message: SessionMessage) {
        if message.kind == MessageKind::Init {
            self.on_session_init(from, message).await;
            return;
        }
        let target = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&message.session_id).copied());
        match target {
            Some(flow_id) => {
                let Ok(sender) = self.entry_sender(flow_id) else {
                    tracing::debug!(flow_id = %flow_id, "message for a finished flow, dropping");
                    return;
                };
                let event = Event::DeliverSessionMessage {
                    session_id: message.session_id,
                    message,
                };
                if sender.send_async(event).await.is_err() {
                    tracing::debug!(flow_id = %flow_id, "worker gone while delivering message");
                }
            }
            None => {
                tracing::debug!(
                    session_id = %message.session_id,
                    kind = %message.kind,
                    "message for an unknown session, dropping"
                );
            }
        }
    }
}

struct ManagerInbound {
    shared: Weak<ManagerShared>,
}

#[async_trait]
impl InboundHandler for ManagerInbound {
    async fn handle(&self, from: PeerId, message: SessionMessage) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(from, message).await;
        }
    }
}

/// The node's flow runtime front door.
pub struct FlowManager {
    shared: Arc<ManagerShared>,
}

impl FlowManager {
    /// Start building a manager for the node named `our_identity`.
    #[must_use]
    pub fn builder(our_identity: PeerId, registry: FlowRegistry) -> FlowManagerBuilder {
        FlowManagerBuilder::new(our_identity, registry)
    }

    /// Start a registered flow with the given start arguments.
    ///
    /// The `Unstarted` checkpoint commits before any user code runs.
    #[tracing::instrument(skip(self, args), err)]
    pub async fn start_flow(
        &self,
        flow_class: &str,
        args: Vec<u8>,
    ) -> Result<FlowHandle, ManagerError> {
        let shared = &self.shared;
        let spec = shared.registry.spec(flow_class)?.clone();
        let logic = (spec.construct)(&args)?;

        let flow_id = FlowId::random();
        let invocation = InvocationContext {
            flow_class: spec.name.clone(),
            flow_version: spec.version,
            origin: StartOrigin::Rpc,
            started_at: shared.clock.now(),
            start_args: args,
        };
        let checkpoint = Checkpoint::unstarted(
            flow_id,
            invocation,
            shared.our_identity.clone(),
            spec.idempotent,
            spec.timed,
        );

        let blob = shared.codec.encode(&checkpoint)?;
        let mut txn = shared.store.begin().await?;
        txn.add(flow_id, blob).await?;
        txn.commit().await?;

        let (sender, started, completion) = shared.spawn_worker(
            checkpoint.clone(),
            Some(logic),
            Some(shared.instance_id),
            Some(checkpoint),
        );
        sender
            .send_async(Event::DoRemainingWork)
            .await
            .map_err(|_| ManagerError::InboxClosed { flow_id })?;

        Ok(FlowHandle {
            flow_id,
            started,
            completion,
        })
    }

    /// Request cancellation. The flow completes its current transition,
    /// then aborts with its checkpoint retained in `Errored`.
    pub async fn kill_flow(&self, flow_id: FlowId) -> Result<(), ManagerError> {
        let sender = self.shared.entry_sender(flow_id)?;
        sender
            .send_async(Event::Error {
                error: FlowError::Cancelled {
                    reason: "killed by operator".to_string(),
                },
            })
            .await
            .map_err(|_| ManagerError::InboxClosed { flow_id })
    }

    /// Inject an event from the host, e.g. an async operation completion or
    /// a ledger commit notification.
    pub async fn external_event(&self, flow_id: FlowId, event: Event) -> Result<(), ManagerError> {
        let sender = self.shared.entry_sender(flow_id)?;
        sender
            .send_async(event)
            .await
            .map_err(|_| ManagerError::InboxClosed { flow_id })
    }

    /// Deliver a session message as if it had arrived from the bus.
    pub async fn deliver(&self, from: PeerId, message: SessionMessage) {
        self.shared.dispatch(from, message).await;
    }

    /// Read-only view of a flow's persisted checkpoint.
    pub async fn snapshot(&self, flow_id: FlowId) -> Result<CheckpointView, ManagerError> {
        let mut txn = self.shared.store.begin().await?;
        let fetched = txn.get(flow_id).await;
        let _ = txn.rollback().await;
        let blob = fetched?.ok_or(ManagerError::FlowNotFound { flow_id })?;
        let checkpoint = self.shared.codec.decode(&blob)?;
        Ok(checkpoint.view())
    }

    /// Ids of the currently live (resident) flows.
    #[must_use]
    pub fn list_flows(&self) -> Vec<FlowId> {
        self.shared
            .flows
            .read()
            .map(|flows| flows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Scan the checkpoint store and reconstruct a worker for every
    /// non-terminal checkpoint. Resumed flows carry no sender UUID: their
    /// outbound messages must be treated as possibly duplicated downstream.
    #[tracing::instrument(skip(self), err)]
    pub async fn restore(&self) -> Result<Vec<FlowId>, ManagerError> {
        let shared = &self.shared;
        let mut txn = shared.store.begin().await?;
        let listed = txn.list().await?;

        let mut plans = Vec::new();
        for (flow_id, blob) in listed {
            let mut checkpoint = match shared.codec.decode(&blob) {
                Ok(checkpoint) => checkpoint,
                Err(error) => {
                    // Undecodable checkpoints are fatal per-flow: admit and
                    // leave the blob in place for the operator.
                    tracing::error!(flow_id = %flow_id, error = %error, "checkpoint decode failed");
                    shared
                        .hospital
                        .admit(
                            flow_id,
                            FlowError::Codec(error),
                            undecodable_view(flow_id, shared.clock.now()),
                        )
                        .await;
                    continue;
                }
            };
            if checkpoint.flow_state.is_terminal() {
                continue;
            }
            // Dedup watermarks survive checkpoint-skipping suspensions;
            // never fall back behind them.
            for (session_id, watermark) in txn.dedup_watermarks(flow_id).await? {
                if let Some(session) = checkpoint.sessions.get_mut(&session_id) {
                    bump_sequence(session, watermark);
                }
            }
            plans.push(checkpoint);
        }
        let _ = txn.rollback().await;

        let mut resumed = Vec::new();
        for checkpoint in plans {
            let flow_id = checkpoint.flow_id;
            shared.hospital.discharge(flow_id).await;
            let (sender, _started, _completion) =
                shared.spawn_worker(checkpoint.clone(), None, None, Some(checkpoint));
            sender
                .send_async(Event::RetryFlowFromSafePoint)
                .await
                .map_err(|_| ManagerError::InboxClosed { flow_id })?;
            resumed.push(flow_id);
        }
        Ok(resumed)
    }

    /// True once `Action::HaltProcess` fired; the host supervisor should
    /// terminate and restart the process.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.halt.is_halted()
    }

    /// Resolves when `Action::HaltProcess` fires.
    pub async fn wait_for_halt(&self) {
        self.shared.halt.wait().await;
    }

    /// Graceful shutdown: workers finish their current transition, park
    /// with checkpoints intact, and the unfinished-flows gate drains.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.gate.wait().await;
    }
}

fn bump_sequence(session: &mut SessionInfo, watermark: u64) {
    match &mut session.phase {
        SessionPhase::Initiating { sequence, .. } | SessionPhase::Initiated { sequence, .. } => {
            *sequence = (*sequence).max(watermark);
        }
        _ => {}
    }
}

fn undecodable_view(flow_id: FlowId, now: chrono::DateTime<chrono::Utc>) -> CheckpointView {
    CheckpointView {
        flow_id,
        flow_class: "<undecodable>".to_string(),
        state: "unknown".to_string(),
        suspend_count: 0,
        retries: 0,
        session_count: 0,
        errored: true,
        progress: None,
        started_at: now,
    }
}
