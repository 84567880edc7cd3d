//! Clock collaborator: wall-clock reads and one-shot timers.
//!
//! Everything time-dependent in the runtime (sleeps, retry backoff,
//! timed-flow timeouts) goes through this seam so tests can drive time by
//! hand with [`ManualClock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Monotonic-enough time source plus one-shot timers.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Complete after `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

/// The real thing: chrono for timestamps, tokio for timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

struct Sleeper {
    deadline: DateTime<Utc>,
    wake: oneshot::Sender<()>,
}

/// Hand-cranked clock for tests: time only moves when [`advance`] is
/// called, firing any timers whose deadline has passed.
///
/// [`advance`]: ManualClock::advance
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleepers: Mutex<Vec<Sleeper>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleepers: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward and fire due timers.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut guard = self.now.lock().expect("clock lock");
            *guard += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
            *guard
        };
        let due: Vec<Sleeper> = {
            let mut sleepers = self.sleepers.lock().expect("clock lock");
            let (fire, keep): (Vec<_>, Vec<_>) =
                sleepers.drain(..).partition(|s| s.deadline <= now);
            *sleepers = keep;
            fire
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Number of timers currently armed; lets tests wait for the runtime to
    /// reach its sleep before advancing.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.sleepers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }

    async fn sleep(&self, duration: Duration) {
        let (tx, rx) = oneshot::channel();
        {
            let now = self.now();
            let deadline =
                now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
            let mut sleepers = self.sleepers.lock().expect("clock lock");
            sleepers.push(Sleeper { deadline, wake: tx });
        }
        // A dropped clock wakes its sleepers rather than stranding them.
        let _ = rx.await;
    }
}
