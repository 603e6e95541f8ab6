//! Timing knobs shared by both supervisors.

use crate::services::backoff::{Backoff, ExponentialBackoff, FixedBackoff};
use std::time::Duration;

/// Which backoff policy a supervisor uses between restarts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffKind {
    /// Same delay every time
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`
    Exponential {
        /// First delay
        initial: Duration,
        /// Upper bound on the delay
        max: Duration,
    },
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(5))
    }
}

impl BackoffKind {
    /// Build a fresh policy instance.
    pub fn build(&self) -> Box<dyn Backoff> {
        match *self {
            Self::Fixed(delay) => Box::new(FixedBackoff::new(delay)),
            Self::Exponential { initial, max } => {
                Box::new(ExponentialBackoff::new(initial, max, 2.0))
            }
        }
    }
}

/// Supervisor timing configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delay policy between restart attempts
    pub backoff: BackoffKind,
    /// Max time for SSH connect + authentication
    pub ready_timeout: Duration,
    /// SSH keepalive interval
    pub keepalive_interval: Duration,
    /// Unanswered keepalives before the session is considered dead
    pub keepalive_max: usize,
    /// Interval between pool health checks once the pool is live
    pub health_check_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::default(),
            ready_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(10),
            keepalive_max: 5,
            health_check_interval: Duration::from_secs(10),
        }
    }
}
