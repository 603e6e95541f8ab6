//! Delay policies inserted between restart attempts.
//!
//! Supervisors only ever ask for the next delay and reset after a success, so
//! any policy can be swapped in without touching the restart loops. Attempts
//! are unbounded: a supervisor keeps retrying until its resource is back.

use std::time::Duration;

/// A restart delay policy.
pub trait Backoff: Send + Sync {
    /// Delay before the next attempt.
    fn next_delay(&mut self) -> Duration;

    /// Forget previous failures after a successful establishment.
    fn reset(&mut self);

    /// Failed attempts since the last reset.
    fn attempt(&self) -> u32;
}

/// Same delay before every attempt.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
    attempt: u32,
}

impl FixedBackoff {
    /// Create a fixed-delay policy.
    pub fn new(delay: Duration) -> Self {
        Self { delay, attempt: 0 }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Multiplying delay with an upper bound.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create an exponential policy.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);

        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        delay
    }

    fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }
}
