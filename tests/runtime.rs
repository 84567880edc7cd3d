//! End-to-end runtime tests: two managers on one in-process bus, timed
//! retries, cancellation, shutdown, and restore.

mod common;

use std::sync::Arc;
use std::time::Duration;

use flowstate::bus::InProcessBus;
use flowstate::checkpoint::store::InMemoryCheckpointStore;
use flowstate::clock::{ManualClock, SystemClock};
use flowstate::ids::{PeerId, SessionId};
use flowstate::manager::ManagerError;
use flowstate::messages::{MessageKind, SessionMessage};
use flowstate::monitor::FlowLifecycleEvent;
use flowstate::registry::FlowRegistry;

use common::{
    PingFlow, RejectingResponder, SleepyFlow, await_event, fast_retry, json_spec, node,
    ping_echo_registries, wait_until,
};

const ALPHA: &str = "O=Alpha,L=Zurich";
const BETA: &str = "O=Beta,L=Oslo";

/// S1: the full exchange. One checkpoint for the suspension, one init on
/// the wire, an echoed reply, and no checkpoint left behind afterwards.
#[tokio::test]
async fn ping_pong_across_two_nodes() {
    let bus = Arc::new(InProcessBus::new());
    let (alpha_registry, beta_registry) = ping_echo_registries(false);

    let alpha = node(
        ALPHA,
        alpha_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;
    let _beta = node(
        BETA,
        beta_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let mut handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::args(BETA))
        .await
        .expect("start");
    let flow_id = handle.flow_id;
    assert!(handle.wait_until_started().await);

    let result = handle.result().await.expect("the exchange completes");
    assert_eq!(result, b"ping".to_vec(), "the responder echoes the payload");

    // Exactly one durable suspension on the initiator side.
    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::CheckpointPersisted { revision, .. } if *revision == 1)
    })
    .await;
    await_event(&alpha.events, |event| {
        matches!(
            event,
            FlowLifecycleEvent::Finished { outcome, .. } if outcome == "completed"
        )
    })
    .await;

    let sent = bus.sent_log();
    let inits: Vec<_> = sent
        .iter()
        .filter(|(_, _, m)| m.kind == MessageKind::Init)
        .collect();
    assert_eq!(inits.len(), 1);
    assert!(
        sent.iter()
            .any(|(from, _, m)| m.kind == MessageKind::Data
                && m.payload == b"ping".to_vec()
                && from.as_str() == BETA),
        "the echo travels back as a data envelope"
    );

    // The finished flow's checkpoint is gone.
    match alpha.manager.snapshot(flow_id).await {
        Err(ManagerError::FlowNotFound { .. }) => {}
        other => panic!("expected the checkpoint to be removed, got {other:?}"),
    }
}

/// Invariant 6: an idempotent responder performs no intermediate
/// `PersistCheckpoint` in its lifetime.
#[tokio::test]
async fn idempotent_responder_skips_every_intermediate_checkpoint() {
    let bus = Arc::new(InProcessBus::new());
    let (alpha_registry, beta_registry) = ping_echo_registries(true);

    let alpha = node(
        ALPHA,
        alpha_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;
    let beta = node(
        BETA,
        beta_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::args(BETA))
        .await
        .expect("start");
    assert_eq!(handle.result().await.expect("completes"), b"ping".to_vec());

    await_event(&beta.events, |event| {
        matches!(
            event,
            FlowLifecycleEvent::Finished { outcome, .. } if outcome == "completed"
        )
    })
    .await;

    let persisted: Vec<_> = beta
        .events
        .drain()
        .filter(|event| matches!(event, FlowLifecycleEvent::CheckpointPersisted { .. }))
        .collect();
    assert!(
        persisted.is_empty(),
        "idempotent responder persisted intermediate checkpoints: {persisted:?}"
    );
}

/// S5: a rejecting counterparty fails the initiator with its exception,
/// and both flows land in their hospitals.
#[tokio::test]
async fn rejection_propagates_to_the_initiator() {
    let bus = Arc::new(InProcessBus::new());
    let mut alpha_registry = FlowRegistry::new();
    alpha_registry.register(json_spec::<PingFlow>("PingFlow", 1));
    let mut beta_registry = FlowRegistry::new();
    beta_registry.register(json_spec::<RejectingResponder>("RejectingResponder", 1));
    beta_registry.register_responder("PingFlow", "RejectingResponder");

    let alpha = node(
        ALPHA,
        alpha_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;
    let beta = node(
        BETA,
        beta_registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::args(BETA))
        .await
        .expect("start");
    let flow_id = handle.flow_id;

    let failure = handle.result().await.expect_err("the rejection surfaces");
    assert_eq!(failure.message, "NotAuthorised");

    wait_until(|| !alpha.hospital.admissions().is_empty()).await;
    assert!(
        alpha
            .hospital
            .admissions()
            .iter()
            .any(|(id, _)| *id == flow_id)
    );
    wait_until(|| !beta.hospital.admissions().is_empty()).await;

    // The errored checkpoint is retained for the hospital.
    let view = alpha.manager.snapshot(flow_id).await.expect("retained");
    assert_eq!(view.state, "failed");
    assert!(view.errored);
}

/// Cancellation: the flow finishes its current transition, aborts, and the
/// errored checkpoint plus progress step are retained.
#[tokio::test]
async fn kill_flow_quarantines_with_checkpoint_retained() {
    let bus = Arc::new(InProcessBus::new());
    let mut registry = FlowRegistry::new();
    registry.register(json_spec::<SleepyFlow>("SleepyFlow", 1));

    let alpha = node(
        ALPHA,
        registry,
        bus,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("SleepyFlow", b"{}".to_vec())
        .await
        .expect("start");
    let flow_id = handle.flow_id;

    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::Suspended { request, .. } if request == "sleep")
    })
    .await;

    let view = alpha.manager.snapshot(flow_id).await.expect("suspended");
    assert_eq!(view.state, "suspended");
    assert_eq!(view.progress.as_deref(), Some("sleeping"));

    alpha.manager.kill_flow(flow_id).await.expect("kill");
    let failure = handle.result().await.expect_err("killed");
    assert!(failure.message.contains("cancelled"));

    wait_until(|| !alpha.hospital.admissions().is_empty()).await;
    let view = alpha.manager.snapshot(flow_id).await.expect("retained");
    assert_eq!(view.state, "failed");
    assert!(view.errored);

    // The sticky soft-lock was released on the terminal abort.
    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::SoftLocksReleased { .. })
    })
    .await;
}

/// A sleeping flow wakes when its timer fires and releases its soft locks
/// on the way out.
#[tokio::test]
async fn sleep_wakes_on_the_clock() {
    let bus = Arc::new(InProcessBus::new());
    let mut registry = FlowRegistry::new();
    registry.register(json_spec::<SleepyFlow>("SleepyFlow", 1));
    let clock = Arc::new(ManualClock::default());

    let alpha = node(
        ALPHA,
        registry,
        bus,
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::clone(&clock) as Arc<dyn flowstate::clock::Clock>,
        fast_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("SleepyFlow", b"{}".to_vec())
        .await
        .expect("start");

    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::Suspended { request, .. } if request == "sleep")
    })
    .await;
    wait_until(|| clock.armed_timers() >= 1).await;

    // Generous advance: the wake timer carries jitter.
    clock.advance(Duration::from_secs(4200));

    let result = handle.result().await.expect("the sleeper finishes");
    assert_eq!(result, b"rested".to_vec());
    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::SoftLocksReleased { .. })
    })
    .await;
}

/// S6: a timed flow with no progress is retried from its safe point; the
/// re-sent initiation keeps its sequence number and bumps the retry
/// counter in the dedup id.
#[tokio::test]
async fn timed_flow_expiry_retries_from_safe_point() {
    let bus = Arc::new(InProcessBus::new());
    let mut registry = FlowRegistry::new();
    registry.register(json_spec::<PingFlow>("PingFlow", 1));
    let clock = Arc::new(ManualClock::default());

    let alpha = node(
        ALPHA,
        registry,
        Arc::clone(&bus),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::clone(&clock) as Arc<dyn flowstate::clock::Clock>,
        fast_retry(),
    )
    .await;

    // Nobody answers on O=Nowhere: the flow parks until its timeout.
    let _handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::timed_args("O=Nowhere,L=Limbo", 30))
        .await
        .expect("start");

    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::CheckpointPersisted { revision, .. } if *revision == 1)
    })
    .await;
    wait_until(|| clock.armed_timers() >= 1).await;

    clock.advance(Duration::from_secs(31));

    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::Retried { attempt, .. } if *attempt == 1)
    })
    .await;
    wait_until(|| {
        bus.sent_log()
            .iter()
            .filter(|(_, _, m)| m.kind == MessageKind::Init)
            .count()
            == 2
    })
    .await;

    let inits: Vec<String> = bus
        .sent_log()
        .into_iter()
        .filter(|(_, _, m)| m.kind == MessageKind::Init)
        .map(|(_, _, m)| m.deduplication_id)
        .collect();
    assert!(
        !inits[0].contains("-r"),
        "first attempt carries no retry counter: {}",
        inits[0]
    );
    assert!(
        inits[1].contains("-r1"),
        "the retried init bumps the retry counter: {}",
        inits[1]
    );
}

/// Shutdown parks live flows with their checkpoints intact; a new manager
/// over the same store resumes them and they run to completion.
#[tokio::test]
async fn shutdown_then_restore_resumes_parked_flows() {
    let bus = Arc::new(InProcessBus::new());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let mut registry = FlowRegistry::new();
    registry.register(json_spec::<PingFlow>("PingFlow", 1));

    let first = node(
        ALPHA,
        registry.clone(),
        Arc::clone(&bus),
        Arc::clone(&store) as Arc<dyn flowstate::checkpoint::store::CheckpointStore>,
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let handle = first
        .manager
        .start_flow("PingFlow", PingFlow::args("O=Nowhere,L=Limbo"))
        .await
        .expect("start");
    let flow_id = handle.flow_id;

    await_event(&first.events, |event| {
        matches!(event, FlowLifecycleEvent::CheckpointPersisted { revision, .. } if *revision == 1)
    })
    .await;
    first.manager.shutdown().await;

    let view = first.manager.snapshot(flow_id).await.expect("still there");
    assert_eq!(view.state, "suspended");

    let second = node(
        ALPHA,
        registry,
        Arc::clone(&bus),
        Arc::clone(&store) as Arc<dyn flowstate::checkpoint::store::CheckpointStore>,
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;
    let resumed = second.manager.restore().await.expect("restore");
    assert_eq!(resumed, vec![flow_id]);

    // Answer the ping by hand: the session id is derived, so the test can
    // address the parked flow directly.
    let session_id = SessionId::derive(flow_id, 0);
    await_event(&second.events, |event| {
        matches!(event, FlowLifecycleEvent::Retried { .. })
    })
    .await;
    second
        .manager
        .deliver(
            PeerId::new("O=Nowhere,L=Limbo"),
            SessionMessage::data(session_id, Some(session_id), 0, "pong-0", b"pong".to_vec()),
        )
        .await;

    await_event(&second.events, |event| {
        matches!(
            event,
            FlowLifecycleEvent::Finished { outcome, .. } if outcome == "completed"
        )
    })
    .await;
    match second.manager.snapshot(flow_id).await {
        Err(ManagerError::FlowNotFound { .. }) => {}
        other => panic!("expected the checkpoint to be removed, got {other:?}"),
    }
}
