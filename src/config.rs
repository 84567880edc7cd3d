//! Runtime configuration.
//!
//! Defaults resolve from the environment (a `.env` file is honoured via
//! dotenvy), with builder-style `with_*` overrides for embedding.

use std::time::Duration;

/// Bounded exponential backoff for safe-point retries.
///
/// The exact hospital readmission policy is host configuration; this is the
/// in-runtime bound: `base_delay * 2^attempt`, capped at `max_delay`, for at
/// most `max_attempts` attempts before the flow is admitted to the hospital.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based). Deterministic; the
    /// action executor layers jitter on top when arming the timer.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Configuration for a [`FlowManager`](crate::manager::FlowManager).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Capacity of each flow's bounded event inbox.
    pub inbox_capacity: usize,
    pub retry: RetryPolicy,
    /// Database name for the sqlite checkpoint store, when used.
    pub sqlite_db_name: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: Self::resolve_inbox_capacity(None),
            retry: RetryPolicy::default(),
            sqlite_db_name: Self::resolve_sqlite_db_name(None),
        }
    }
}

impl RuntimeConfig {
    const DEFAULT_INBOX_CAPACITY: usize = 256;

    fn resolve_inbox_capacity(provided: Option<usize>) -> usize {
        if let Some(capacity) = provided {
            return capacity.max(1);
        }
        dotenvy::dotenv().ok();
        std::env::var("FLOWSTATE_INBOX_CAPACITY")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Self::DEFAULT_INBOX_CAPACITY)
    }

    fn resolve_sqlite_db_name(provided: Option<String>) -> Option<String> {
        if provided.is_some() {
            return provided;
        }
        dotenvy::dotenv().ok();
        std::env::var("FLOWSTATE_SQLITE_DB_NAME").ok()
    }

    #[must_use]
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = Self::resolve_inbox_capacity(Some(capacity));
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_sqlite_db_name(mut self, name: impl Into<String>) -> Self {
        self.sqlite_db_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(30), Duration::from_millis(500));
    }
}
