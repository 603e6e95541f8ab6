//! Observable lifecycle states of the supervised resources.

use std::net::SocketAddr;
use std::time::Duration;

/// Current state of the tunnel supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TunnelStatus {
    /// Opening the session and binding the listener
    #[default]
    Connecting,
    /// Session authenticated and listener accepting
    Ready {
        /// Address the listener is bound to
        local_addr: SocketAddr,
        /// Count of sessions established so far, starting at 1
        generation: u64,
    },
    /// Waiting out the backoff before the next attempt
    Reconnecting {
        /// Consecutive failed attempts
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Shut down; no session and no listener
    Stopped,
}

impl TunnelStatus {
    /// Check if a session is live.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Get the session generation if live.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Ready { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Current state of the pool supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PoolState {
    /// Building a pool and running the liveness probe
    #[default]
    Creating,
    /// Probe succeeded; queries are accepted
    Ready {
        /// Count of pools marked live so far, starting at 1
        generation: u64,
    },
    /// Waiting out the backoff before the next attempt
    Recreating {
        /// Consecutive failed attempts
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Shut down; no pool
    Stopped,
}

impl PoolState {
    /// Check if the pool is live.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Get the pool generation if live.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Ready { generation } => Some(*generation),
            _ => None,
        }
    }
}
