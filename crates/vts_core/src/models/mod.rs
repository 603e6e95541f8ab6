//! Configuration and status types shared by the supervisors.

pub mod pool;
pub mod status;
pub mod supervisor;
pub mod tunnel;

pub use pool::{PoolConfig, Rows};
pub use status::{PoolState, TunnelStatus};
pub use supervisor::{BackoffKind, SupervisorConfig};
pub use tunnel::{Secret, SshAuth, SshEndpoint, TunnelConfig};
