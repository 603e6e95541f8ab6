//! Connection-resilience core for the vehicle telemetry backend.
//!
//! This crate keeps one SSH tunnel and one PostgreSQL pool alive and hands a
//! query capability to the HTTP layer:
//!
//! - **error**: Fault taxonomy with PostgreSQL-specific details
//! - **models**: Tunnel, pool and supervisor configuration; status types
//! - **services**: Backoff, SSH transport, forwarding listener, supervisors
//! - **startup**: Ordered startup of the tunnel and then the pool
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod startup;

#[cfg(test)]
mod test_support;

pub use error::VtsError;
pub use models::{
    BackoffKind, PoolConfig, PoolState, Rows, Secret, SshAuth, SshEndpoint, SupervisorConfig,
    TunnelConfig, TunnelStatus,
};
pub use services::{PoolSupervisor, QueryRunner, TunnelSupervisor};
pub use startup::{LiveOrchestrator, StartupOrchestrator};
