//! Shared fixtures for the integration suites: user flows, a crash-prone
//! store wrapper, and a two-node harness over the in-process bus.
#![allow(dead_code)]

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flowstate::bus::InProcessBus;
use flowstate::checkpoint::codec::CodecError;
use flowstate::checkpoint::store::{
    CheckpointStore, InMemoryCheckpointStore, StoreError, StoreTransaction,
};
use flowstate::clock::Clock;
use flowstate::config::{RetryPolicy, RuntimeConfig};
use flowstate::errors::FlowException;
use flowstate::flow::{FlowContext, FlowLogic, FlowPoll, ResumeInput};
use flowstate::hospital::RecordingHospital;
use flowstate::ids::{FlowId, PeerId, SessionId};
use flowstate::io::{FlowIoRequest, ResumeValue};
use flowstate::manager::FlowManager;
use flowstate::monitor::{ChannelMonitor, FlowLifecycleEvent, MonitorSet};
use flowstate::registry::{FlowRegistry, FlowSpec};

pub fn json_continuation<T: Serialize>(flow: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(flow).map_err(|e| CodecError::Serialize {
        message: e.to_string(),
    })
}

/// Build a serde-backed [`FlowSpec`] for `T`.
pub fn json_spec<T>(name: &str, version: u32) -> FlowSpec
where
    T: FlowLogic + Serialize + DeserializeOwned + 'static,
{
    FlowSpec::new(
        name,
        version,
        |args: &[u8]| {
            let flow: T = serde_json::from_slice(args).map_err(|e| CodecError::Section {
                section: "flow_state",
                message: format!("start args: {e}"),
            })?;
            Ok(Box::new(flow) as Box<dyn FlowLogic>)
        },
        |blob: &[u8]| {
            let flow: T = serde_json::from_slice(blob).map_err(|e| CodecError::Section {
                section: "flow_state",
                message: format!("continuation: {e}"),
            })?;
            Ok(Box::new(flow) as Box<dyn FlowLogic>)
        },
    )
}

// ---------------------------------------------------------------------------
// User flows
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum PingStage {
    #[default]
    Start,
    AwaitReply,
}

/// Initiator: opens a session, sends "ping", returns the reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingFlow {
    pub peer: String,
    #[serde(default)]
    pub stage: PingStage,
    /// Declare a timed-flow wait-timeout in seconds before the exchange.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PingFlow {
    pub fn args(peer: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "peer": peer })).expect("static json")
    }

    pub fn timed_args(peer: &str, timeout_secs: u64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "peer": peer, "timeout_secs": timeout_secs }))
            .expect("static json")
    }
}

impl FlowLogic for PingFlow {
    fn resume(
        &mut self,
        ctx: &mut FlowContext,
        input: ResumeInput,
    ) -> Result<FlowPoll, FlowException> {
        match self.stage {
            PingStage::Start => {
                if let Some(secs) = self.timeout_secs {
                    ctx.update_timed_flow_timeout(Duration::from_secs(secs));
                }
                let session = ctx.initiate_session(PeerId::new(&self.peer));
                self.stage = PingStage::AwaitReply;
                let mut payloads = BTreeMap::new();
                payloads.insert(session, b"ping".to_vec());
                Ok(FlowPoll::suspend(FlowIoRequest::SendAndReceive {
                    payloads,
                }))
            }
            PingStage::AwaitReply => match input {
                ResumeInput::Value(ResumeValue::Messages(mut replies)) => {
                    let reply = replies
                        .pop_first()
                        .map(|(_, payload)| payload)
                        .unwrap_or_default();
                    Ok(FlowPoll::finished(reply))
                }
                ResumeInput::Failed(exception) => Err(exception),
                other => Err(FlowException::new(format!(
                    "expected a reply, got {other:?}"
                ))),
            },
        }
    }

    fn continuation(&self) -> Result<Vec<u8>, CodecError> {
        json_continuation(self)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum EchoStage {
    #[default]
    AwaitPing,
    Reply {
        session: SessionId,
    },
    Finish,
}

/// Responder: receives one payload and echoes it back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EchoResponder {
    #[serde(default)]
    pub stage: EchoStage,
}

impl FlowLogic for EchoResponder {
    fn resume(
        &mut self,
        ctx: &mut FlowContext,
        input: ResumeInput,
    ) -> Result<FlowPoll, FlowException> {
        match self.stage.clone() {
            EchoStage::AwaitPing => {
                let (session, _) = ctx
                    .sessions()
                    .first()
                    .cloned()
                    .ok_or_else(|| FlowException::new("no initiating session"))?;
                self.stage = EchoStage::Reply { session };
                Ok(FlowPoll::suspend(FlowIoRequest::Receive {
                    sessions: BTreeSet::from([session]),
                }))
            }
            EchoStage::Reply { session } => match input {
                ResumeInput::Value(ResumeValue::Messages(mut received)) => {
                    let payload = received.remove(&session).unwrap_or_default();
                    self.stage = EchoStage::Finish;
                    let mut payloads = BTreeMap::new();
                    payloads.insert(session, payload);
                    Ok(FlowPoll::suspend(FlowIoRequest::Send { payloads }))
                }
                other => Err(FlowException::new(format!(
                    "expected the ping, got {other:?}"
                ))),
            },
            EchoStage::Finish => Ok(FlowPoll::finished(b"echoed".to_vec())),
        }
    }

    fn continuation(&self) -> Result<Vec<u8>, CodecError> {
        json_continuation(self)
    }
}

/// Responder that rejects every initiation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RejectingResponder;

impl FlowLogic for RejectingResponder {
    fn resume(
        &mut self,
        _ctx: &mut FlowContext,
        _input: ResumeInput,
    ) -> Result<FlowPoll, FlowException> {
        Err(FlowException::new("NotAuthorised"))
    }

    fn continuation(&self) -> Result<Vec<u8>, CodecError> {
        json_continuation(self)
    }
}

/// Reports progress, marks its states soft-locked, then sleeps for an hour.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SleepyFlow {
    #[serde(default)]
    pub slept: bool,
}

impl FlowLogic for SleepyFlow {
    fn resume(
        &mut self,
        ctx: &mut FlowContext,
        _input: ResumeInput,
    ) -> Result<FlowPoll, FlowException> {
        if self.slept {
            return Ok(FlowPoll::finished(b"rested".to_vec()));
        }
        ctx.set_progress("sleeping");
        ctx.mark_soft_locked();
        self.slept = true;
        Ok(FlowPoll::suspend(FlowIoRequest::Sleep {
            duration: Duration::from_secs(3600),
        }))
    }

    fn continuation(&self) -> Result<Vec<u8>, CodecError> {
        json_continuation(self)
    }
}

// ---------------------------------------------------------------------------
// Crash-prone store
// ---------------------------------------------------------------------------

/// Wraps a store and fails commits numbered `fail_from..fail_from + count`
/// (1-based) with a transient error, after the outbox already flushed —
/// the sharpest point to cut the power.
pub struct FailingCommitStore {
    inner: Arc<dyn CheckpointStore>,
    commits: Arc<AtomicU32>,
    fail_from: u32,
    fail_count: u32,
}

impl FailingCommitStore {
    pub fn fail_commits(inner: Arc<dyn CheckpointStore>, fail_from: u32, fail_count: u32) -> Self {
        Self {
            inner,
            commits: Arc::new(AtomicU32::new(0)),
            fail_from,
            fail_count,
        }
    }
}

#[async_trait]
impl CheckpointStore for FailingCommitStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(FailingCommitTransaction {
            inner: self.inner.begin().await?,
            commits: Arc::clone(&self.commits),
            fail_from: self.fail_from,
            fail_count: self.fail_count,
        }))
    }
}

struct FailingCommitTransaction {
    inner: Box<dyn StoreTransaction>,
    commits: Arc<AtomicU32>,
    fail_from: u32,
    fail_count: u32,
}

#[async_trait]
impl StoreTransaction for FailingCommitTransaction {
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<(), StoreError> {
        self.inner.add(flow_id, blob).await
    }

    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<(), StoreError> {
        self.inner.update(flow_id, blob).await
    }

    async fn remove(&mut self, flow_id: FlowId) -> Result<(), StoreError> {
        self.inner.remove(flow_id).await
    }

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(flow_id).await
    }

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>, StoreError> {
        self.inner.list().await
    }

    async fn record_dedup_watermark(
        &mut self,
        flow_id: FlowId,
        session_id: SessionId,
        sequence: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .record_dedup_watermark(flow_id, session_id, sequence)
            .await
    }

    async fn dedup_watermarks(
        &mut self,
        flow_id: FlowId,
    ) -> Result<Vec<(SessionId, u64)>, StoreError> {
        self.inner.dedup_watermarks(flow_id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let number = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = number >= self.fail_from
            && number - self.fail_from < self.fail_count;
        if failing {
            self.inner.rollback().await?;
            return Err(StoreError::Busy {
                message: format!("injected commit failure #{number}"),
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub manager: FlowManager,
    pub hospital: Arc<RecordingHospital>,
    pub events: flume::Receiver<FlowLifecycleEvent>,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
    }
}

pub fn stalled_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(3600),
        max_delay: Duration::from_secs(3600),
    }
}

pub async fn node(
    identity: &str,
    registry: FlowRegistry,
    bus: Arc<InProcessBus>,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
) -> TestNode {
    let hospital = Arc::new(RecordingHospital::new());
    let (events_tx, events) = flume::unbounded();
    let manager = FlowManager::builder(identity.into(), registry)
        .with_config(RuntimeConfig::default().with_retry(retry))
        .with_store(store)
        .with_bus(bus)
        .with_clock(clock)
        .with_hospital(Arc::clone(&hospital) as Arc<dyn flowstate::hospital::Hospital>)
        .with_monitor(MonitorSet::new().with_sink(ChannelMonitor::new(events_tx)))
        .build()
        .await
        .expect("manager build");
    TestNode {
        manager,
        hospital,
        events,
    }
}

/// Two-node registry pair for the ping/echo exchange.
pub fn ping_echo_registries(idempotent_responder: bool) -> (FlowRegistry, FlowRegistry) {
    let mut alpha = FlowRegistry::new();
    alpha.register(json_spec::<PingFlow>("PingFlow", 1));

    let mut beta = FlowRegistry::new();
    let responder = if idempotent_responder {
        json_spec::<EchoResponder>("EchoResponder", 1).idempotent()
    } else {
        json_spec::<EchoResponder>("EchoResponder", 1)
    };
    beta.register(responder);
    beta.register_responder("PingFlow", "EchoResponder");
    (alpha, beta)
}

/// Poll `condition` every 10ms until it holds, failing after two seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Wait for the next lifecycle event matching `matches`, failing after two
/// seconds of real time.
pub async fn await_event<F>(
    events: &flume::Receiver<FlowLifecycleEvent>,
    mut matches: F,
) -> FlowLifecycleEvent
where
    F: FnMut(&FlowLifecycleEvent) -> bool,
{
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            let event = events
                .recv_async()
                .await
                .expect("monitor channel closed while waiting");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for lifecycle event")
}
