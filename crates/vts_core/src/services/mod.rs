//! Connection services: backoff, transport, forwarding and the two
//! supervisors built on them.

pub mod backoff;
pub mod forward;
pub mod pool;
pub mod pool_supervisor;
pub mod transport;
pub mod tunnel;

pub use backoff::{Backoff, ExponentialBackoff, FixedBackoff};
pub use forward::ForwardListener;
pub use pool::{DataPool, PgBackend, PgPool, PoolBackend, QueryRunner, PROBE_SQL};
pub use pool_supervisor::PoolSupervisor;
pub use transport::{
    BoxedStream, RelayStream, SshConnector, SshTransport, TransportConnector, TunnelTransport,
};
pub use tunnel::TunnelSupervisor;
