//! Retry and backoff policy for pipeline stages.
//!
//! Backoff is a pure function of the attempt number and the policy; jitter
//! is applied on top from an injected factor so tests stay deterministic.
//! Whether a failure is retried at all is decided by its
//! [`ErrorClass`](crate::error::ErrorClass), never by the error's shape.

use std::time::Duration;

use rand::RngExt;

/// Exponential backoff policy with jitter.
///
/// The delay before attempt `n + 1` (after the `n`-th failure) is
/// `base_delay * multiplier^(n - 1)`, capped at `max_delay`, with
/// `±jitter` proportional noise applied last.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Proportional jitter in `[0.0, 1.0]`; 0.2 means ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt ceiling and default timings.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the growth multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the jitter proportion.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Returns whether another attempt is allowed after `attempt` failures.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Base (jitter-free) delay after the `attempt`-th failure.
    ///
    /// The sequence is non-decreasing in `attempt` up to `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.powi(exponent as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Delay after the `attempt`-th failure with a caller-supplied jitter
    /// factor in `[-1.0, 1.0]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base = self.base_delay_for(attempt).as_secs_f64();
        let factor = jitter_factor.clamp(-1.0, 1.0);
        let jittered = base * (1.0 + self.jitter * factor);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Delay after the `attempt`-th failure with random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.jitter == 0.0 {
            return self.base_delay_for(attempt);
        }
        let factor = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_jitter(attempt, factor)
    }
}
