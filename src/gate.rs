//! Coordination primitives shared by the manager, workers, and executors.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

use crate::clock::Clock;
use crate::events::Event;
use crate::ids::FlowId;

/// Countdown gate over the set of unfinished flows.
///
/// Each worker counts down exactly once when it terminates; the manager's
/// shutdown waits for the count to reach zero.
#[derive(Default)]
pub(crate) struct FlowGate {
    count: AtomicUsize,
    notify: Notify,
}

impl FlowGate {
    pub(crate) fn register(self: &Arc<Self>) -> GateGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        GateGuard {
            gate: Arc::clone(self),
            counted: AtomicBool::new(false),
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn count_down(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Counts down its gate exactly once, on [`complete`](Self::complete) or
/// drop, whichever comes first.
pub(crate) struct GateGuard {
    gate: Arc<FlowGate>,
    counted: AtomicBool,
}

impl GateGuard {
    pub(crate) fn complete(&self) {
        if !self.counted.swap(true, Ordering::SeqCst) {
            self.gate.count_down();
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

/// One-shot timers that post `RetryFlowFromSafePoint` on timed-flow expiry.
/// Re-arming replaces the previous timer.
#[derive(Clone, Default)]
pub(crate) struct FlowTimeouts {
    inner: Arc<Mutex<FxHashMap<FlowId, tokio::task::JoinHandle<()>>>>,
}

impl FlowTimeouts {
    pub(crate) fn arm(
        &self,
        flow_id: FlowId,
        timeout: Duration,
        sender: flume::Sender<Event>,
        clock: Arc<dyn Clock>,
    ) {
        let handle = tokio::spawn(async move {
            clock.sleep(timeout).await;
            let _ = sender.send_async(Event::RetryFlowFromSafePoint).await;
        });
        if let Ok(mut timers) = self.inner.lock() {
            if let Some(previous) = timers.insert(flow_id, handle) {
                previous.abort();
            }
        }
    }

    pub(crate) fn cancel(&self, flow_id: FlowId) {
        if let Ok(mut timers) = self.inner.lock() {
            if let Some(handle) = timers.remove(&flow_id) {
                handle.abort();
            }
        }
    }
}

/// Resolves a flow's started-waiter exactly once.
#[derive(Default)]
pub(crate) struct StartSignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl StartSignal {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn fire(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Process-halt signal raised by `Action::HaltProcess`.
///
/// The library surfaces the signal; actually terminating the process is the
/// host supervisor's decision.
#[derive(Clone, Default)]
pub struct HaltSignal {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    halted: AtomicBool,
    notify: Notify,
}

impl HaltSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_halted() {
                return;
            }
            notified.await;
        }
    }
}
