//! Wait schedule between selection passes.

use std::time::Duration;

use rand::Rng;

/// Fixed base wait plus uniform jitter, for a bounded number of passes.
///
/// Every wait lies in `[base_wait, base_wait + jitter]`. The jitter keeps
/// processes that found the pool full at the same moment from retrying in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_wait: Duration,
    pub jitter: Duration,
    /// Selection passes, including the first. Zero is treated as one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_wait: Duration, jitter: Duration, max_attempts: u32) -> Self {
        Self {
            base_wait,
            jitter,
            max_attempts,
        }
    }

    /// A single pass with no waiting.
    pub fn once() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Draw the next wait.
    pub fn next_wait(&self) -> Duration {
        let jitter_ns = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter_ns == 0 {
            return self.base_wait;
        }
        let extra = rand::rng().random_range(0..=jitter_ns);
        self.base_wait.saturating_add(Duration::from_nanos(extra))
    }

    /// Upper bound on total sleeping across all passes.
    pub fn worst_case_wait(&self) -> Duration {
        self.base_wait
            .saturating_add(self.jitter)
            .saturating_mul(self.attempts() - 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(1), 60)
    }
}
