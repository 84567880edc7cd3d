//! Crash injection around the commit point: rollback, retry, restart, and
//! the stability of deduplication ids across all of them.

mod common;

use std::sync::Arc;

use flowstate::bus::InProcessBus;
use flowstate::checkpoint::store::InMemoryCheckpointStore;
use flowstate::clock::SystemClock;
use flowstate::manager::ManagerError;
use flowstate::messages::MessageKind;
use flowstate::monitor::FlowLifecycleEvent;
use flowstate::registry::FlowRegistry;

use common::{
    FailingCommitStore, PingFlow, await_event, fast_retry, json_spec, node, stalled_retry,
    wait_until,
};

fn ping_registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.register(json_spec::<PingFlow>("PingFlow", 1));
    registry
}

fn init_dedups(bus: &InProcessBus) -> Vec<String> {
    bus.sent_log()
        .into_iter()
        .filter(|(_, _, message)| message.kind == MessageKind::Init)
        .map(|(_, _, message)| message.deduplication_id)
        .collect()
}

/// A commit failure after the outbox flushed triggers a safe-point retry;
/// the re-driven suspension emits the same envelope with an identical
/// deduplication id, so the downstream de-duplicator collapses the pair.
#[tokio::test]
async fn failed_commit_retries_with_identical_dedup_ids() {
    let bus = Arc::new(InProcessBus::new());
    let inner: Arc<dyn flowstate::checkpoint::store::CheckpointStore> =
        Arc::new(InMemoryCheckpointStore::new());
    // Commit #1 is the unstarted record; #2 is the first suspension.
    let store = Arc::new(FailingCommitStore::fail_commits(inner, 2, 1));

    let alpha = node(
        "O=Alpha,L=Zurich",
        ping_registry(),
        Arc::clone(&bus),
        store,
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::args("O=Beta,L=Oslo"))
        .await
        .expect("start");
    let flow_id = handle.flow_id;

    // The retried suspension eventually commits a real checkpoint.
    await_event(&alpha.events, |event| {
        matches!(event, FlowLifecycleEvent::CheckpointPersisted { .. })
    })
    .await;
    wait_until(|| init_dedups(&bus).len() == 2).await;

    let dedups = init_dedups(&bus);
    assert_eq!(
        dedups[0], dedups[1],
        "the replayed init must carry the same deduplication id"
    );

    let view = alpha.manager.snapshot(flow_id).await.expect("snapshot");
    assert_eq!(view.suspend_count, 1);
    assert_eq!(view.state, "suspended");
}

/// S2: crash between send and commit, then a process restart. The resumed
/// flow re-emits the init with the same logical key and a null sender UUID.
#[tokio::test]
async fn restart_after_crash_reemits_with_null_sender() {
    let bus = Arc::new(InProcessBus::new());
    let inner = Arc::new(InMemoryCheckpointStore::new());
    let crashing = Arc::new(FailingCommitStore::fail_commits(
        Arc::clone(&inner) as Arc<dyn flowstate::checkpoint::store::CheckpointStore>,
        2,
        u32::MAX,
    ));

    let first_incarnation = node(
        "O=Alpha,L=Zurich",
        ping_registry(),
        Arc::clone(&bus),
        crashing,
        Arc::new(SystemClock::new()),
        // The in-process retry is hours away: the "crash" wins.
        stalled_retry(),
    )
    .await;

    let handle = first_incarnation
        .manager
        .start_flow("PingFlow", PingFlow::args("O=Beta,L=Oslo"))
        .await
        .expect("start");
    let flow_id = handle.flow_id;

    wait_until(|| init_dedups(&bus).len() == 1).await;
    first_incarnation.manager.shutdown().await;

    // Only the unstarted record survived the crash: checkpoint writes and
    // sends commit together or neither.
    let second_incarnation = node(
        "O=Alpha,L=Zurich",
        ping_registry(),
        Arc::clone(&bus),
        inner,
        Arc::new(SystemClock::new()),
        fast_retry(),
    )
    .await;
    let pre_restore = second_incarnation
        .manager
        .snapshot(flow_id)
        .await
        .expect("unstarted record survives");
    assert_eq!(pre_restore.state, "unstarted");
    assert_eq!(pre_restore.suspend_count, 0);

    let resumed = second_incarnation.manager.restore().await.expect("restore");
    assert_eq!(resumed, vec![flow_id]);

    wait_until(|| init_dedups(&bus).len() == 2).await;
    let dedups = init_dedups(&bus);

    let logical = |id: &str| id.split('@').next().unwrap_or_default().to_string();
    assert_eq!(
        logical(&dedups[0]),
        logical(&dedups[1]),
        "replay carries the same logical key"
    );
    assert!(
        dedups[1].ends_with("@resumed"),
        "a fresh process resumes with a null sender uuid, got {}",
        dedups[1]
    );
    assert!(dedups[1].starts_with(&flow_id.to_string()));

    // This time the suspension commits for real.
    await_event(&second_incarnation.events, |event| {
        matches!(event, FlowLifecycleEvent::CheckpointPersisted { revision, .. } if *revision == 1)
    })
    .await;
}

/// An injected action fault converts into an `Error` event, rolls the
/// transaction back, and the flow recovers through the retry machinery.
#[tokio::test]
async fn injected_action_fault_recovers_through_retry() {
    use flowstate::config::RuntimeConfig;
    use flowstate::errors::FlowError;
    use flowstate::executor::FaultInjector;
    use flowstate::manager::FlowManager;

    let fault = Arc::new(FaultInjector::once(
        "persist_checkpoint",
        FlowError::Transient {
            message: "injected persist failure".to_string(),
        },
    ));
    let manager = FlowManager::builder("O=Alpha,L=Zurich".into(), ping_registry())
        .with_config(RuntimeConfig::default().with_retry(fast_retry()))
        .with_interceptor(fault)
        .build()
        .await
        .expect("build");

    let handle = manager
        .start_flow("PingFlow", PingFlow::args("O=Beta,L=Oslo"))
        .await
        .expect("start");

    // The retried suspension persists despite the first attempt failing.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if let Ok(view) = manager.snapshot(handle.flow_id).await {
            if view.suspend_count >= 1 {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "flow never recovered from the injected fault"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// With every real commit failing, nothing ever lands in the store no
/// matter how many envelopes hit the wire.
#[tokio::test]
async fn checkpoint_never_outruns_its_commit() {
    let bus = Arc::new(InProcessBus::new());
    let inner: Arc<dyn flowstate::checkpoint::store::CheckpointStore> =
        Arc::new(InMemoryCheckpointStore::new());
    let store = Arc::new(FailingCommitStore::fail_commits(inner, 2, u32::MAX));

    let alpha = node(
        "O=Alpha,L=Zurich",
        ping_registry(),
        Arc::clone(&bus),
        store,
        Arc::new(SystemClock::new()),
        stalled_retry(),
    )
    .await;

    let handle = alpha
        .manager
        .start_flow("PingFlow", PingFlow::args("O=Beta,L=Oslo"))
        .await
        .expect("start");

    wait_until(|| !init_dedups(&bus).is_empty()).await;

    let view = alpha.manager.snapshot(handle.flow_id).await.expect("snapshot");
    assert_eq!(view.state, "unstarted");
    assert_eq!(view.suspend_count, 0);

    match alpha.manager.snapshot(flowstate::ids::FlowId::random()).await {
        Err(ManagerError::FlowNotFound { .. }) => {}
        other => panic!("expected FlowNotFound for a random id, got {other:?}"),
    }
}
