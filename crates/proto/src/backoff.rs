//! Exponential backoff with jitter for accept-loop retries.

use rand::Rng;
use std::time::Duration;

/// Backoff policy: `min * factor^attempt`, capped at `max`, with optional
/// uniform jitter between `min` and the computed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given zero-based attempt.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let min = self.min.as_secs_f64();
        let base = (min * self.factor.powi(attempt as i32)).min(self.max.as_secs_f64());
        let secs = if self.jitter && base > min {
            rand::thread_rng().gen_range(min..=base)
        } else {
            base
        };
        Duration::from_secs_f64(secs)
    }

    /// A fresh attempt counter over this policy.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// A policy plus its attempt counter. Each retry loop owns its own.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Returns the next delay and advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let delay = self.policy.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Resets after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
