//! Tuning knobs for the orchestrator and the reconciliation sweep.

use std::time::Duration;

/// Retry policy for operations that lose the race for an entry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationConfig {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub retry_base_delay: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl ReservationConfig {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1 << exponent)
    }
}

/// Schedule for the background reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Time between sweeps. Zero disables the background loop.
    pub interval: Duration,
    /// Records younger than this are left to the publish that follows commit.
    pub grace: Duration,
    /// Maximum records republished per sweep.
    pub batch_size: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(10),
            batch_size: 100,
        }
    }
}

impl ReconcilerConfig {
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}
