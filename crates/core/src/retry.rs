//! Lock retry schedule value object.
//!
//! The schedule is an immutable ordered sequence of `(lock_timeout, sleep)`
//! pairs. It is constructed once and passed by reference into the lock retry
//! engine, so tests can substitute a short schedule without touching any
//! global state.

use std::time::Duration;

/// One entry of the retry schedule: how long a statement may wait for a lock
/// on this attempt, and how long to sleep before the next attempt if the
/// lock was not obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub lock_timeout: Duration,
    pub sleep: Duration,
}

impl RetryStep {
    pub const fn from_millis(lock_timeout_ms: u64, sleep_ms: u64) -> Self {
        Self {
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            sleep: Duration::from_millis(sleep_ms),
        }
    }
}

/// The default escalation curve: frequent cheap attempts first, then longer
/// waits with longer pauses between them. Total worst-case wall clock stays
/// in the low minutes.
const DEFAULT_SCHEDULE_MS: &[(u64, u64)] = &[
    (100, 50),
    (100, 50),
    (200, 150),
    (300, 250),
    (400, 300),
    (500, 500),
    (500, 500),
    (7_000, 250),
    (7_000, 3_000),
    (7_000, 3_000),
    (10_000, 5_000),
    (10_000, 5_000),
    (10_000, 5_000),
    (15_000, 500),
    (15_000, 10_000),
    (15_000, 10_000),
    (20_000, 500),
    (20_000, 10_000),
    (20_000, 10_000),
    (25_000, 500),
    (25_000, 10_000),
    (30_000, 500),
    (30_000, 10_000),
];

/// An immutable retry schedule plus the operational escape hatch.
///
/// When `disabled` is set the engine performs a single attempt with no lock
/// timeout at all. This exists for local development and emergency manual
/// runs; it is configured explicitly, never read from ambient process state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    steps: Vec<RetryStep>,
    disabled: bool,
}

impl RetryPolicy {
    pub fn new(steps: Vec<RetryStep>) -> Self {
        Self {
            steps,
            disabled: false,
        }
    }

    /// The production default schedule.
    pub fn standard() -> Self {
        Self::new(
            DEFAULT_SCHEDULE_MS
                .iter()
                .map(|&(t, s)| RetryStep::from_millis(t, s))
                .collect(),
        )
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn steps(&self) -> &[RetryStep] {
        &self.steps
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
