//! Explicit retry/backoff state machine shared by queue submission and webhook delivery.

use std::time::Duration;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to the exponential growth.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default policy for transient transport failures: 3 attempts, 1s base, 10s cap.
    pub const fn transport() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Begin iterating the delays this policy allows.
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            policy: *self,
            attempt: 1,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transport()
    }
}

/// Iterator over backoff delays; exhausts once the attempt budget is spent.
///
/// Each yielded delay precedes one retry, so a policy with `max_attempts = 3` yields
/// exactly two delays.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetrySchedule {
    /// Attempts performed so far, counting the initial one.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl Iterator for RetrySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let exponent = self.attempt.saturating_sub(1).min(31);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.policy.max_delay);
        self.attempt += 1;
        Some(delay)
    }
}
