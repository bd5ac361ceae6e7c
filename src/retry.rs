use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;
use crate::job::Job;

/// Fraction of the base delay used for jitter, in both directions.
const JITTER_FRACTION: f64 = 0.2;

/// Decides whether a failed job is retried and how long to wait before the
/// next attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn for_queue(config: &QueueConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap)
    }

    /// A job is retried until it reaches its attempt ceiling. No error-kind
    /// filtering happens here; non-retryable errors are decided by the
    /// dispatcher before consulting the policy.
    pub fn should_retry(&self, job: &Job) -> bool {
        job.attempts_made < job.max_attempts
    }

    /// Deterministic backoff for the attempt that just failed:
    /// `base * 2^(attempts_made - 1)`, capped.
    pub fn base_delay(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(30);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.cap)
    }

    /// Backoff with ±20% jitter, so a burst of jobs failing together does
    /// not retry in lockstep.
    pub fn next_delay(&self, job: &Job) -> Duration {
        let base = self.base_delay(job.attempts_made);
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        base.mul_f64(factor).min(self.cap)
    }
}
