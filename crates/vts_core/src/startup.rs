//! Startup sequencing.
//!
//! The pool connects through the tunnel's local endpoint, so the tunnel must
//! be live before the pool supervisor starts. Only the very first tunnel
//! establishment may abort the process; every later fault is retried by the
//! supervisors themselves.

use crate::error::VtsError;
use crate::models::{PoolConfig, SupervisorConfig, TunnelConfig};
use crate::services::pool::{PgBackend, PoolBackend, QueryRunner};
use crate::services::pool_supervisor::PoolSupervisor;
use crate::services::transport::{SshConnector, TransportConnector};
use crate::services::tunnel::TunnelSupervisor;

use std::net::SocketAddr;
use std::sync::Arc;

/// Orchestrator wired to the SSH connector and deadpool-postgres.
pub type LiveOrchestrator = StartupOrchestrator<SshConnector, PgBackend>;

/// Both supervisors, started in order.
///
/// Holding a value of this type means startup succeeded: the tunnel listener
/// is bound and the pool supervisor is running.
pub struct StartupOrchestrator<C: TransportConnector, B: PoolBackend> {
    tunnel: TunnelSupervisor<C>,
    pool: Arc<PoolSupervisor<B>>,
    local_addr: SocketAddr,
}

impl LiveOrchestrator {
    /// Start with the production SSH connector and PostgreSQL backend.
    pub async fn start_live(
        tunnel_config: TunnelConfig,
        pool_config: PoolConfig,
        supervisor_config: SupervisorConfig,
    ) -> Result<Self, VtsError> {
        let connector = SshConnector::new(&supervisor_config);
        let backend = PgBackend::new(supervisor_config.health_check_interval);
        Self::start(connector, backend, tunnel_config, pool_config, &supervisor_config).await
    }
}

impl<C: TransportConnector, B: PoolBackend> StartupOrchestrator<C, B> {
    /// Establish the tunnel, then start the pool through it.
    ///
    /// Fails with [`VtsError::Startup`] if the first tunnel establishment
    /// fails; no pool is created in that case.
    pub async fn start(
        connector: C,
        backend: B,
        tunnel_config: TunnelConfig,
        pool_config: PoolConfig,
        supervisor_config: &SupervisorConfig,
    ) -> Result<Self, VtsError> {
        tunnel_config.validate()?;
        pool_config.validate()?;

        let tunnel = TunnelSupervisor::new(connector, tunnel_config, supervisor_config.backoff);
        let local_addr = match tunnel.start().await {
            Ok(addr) => addr,
            Err(e) => {
                let fatal = VtsError::startup(e);
                tracing::error!(
                    fault = fatal.category(),
                    hint = fatal.hint().unwrap_or_default(),
                    error = %fatal,
                    "Initial SSH tunnel failed"
                );
                return Err(fatal);
            }
        };

        let pool_config = pool_config.through(local_addr);
        let pool = Arc::new(PoolSupervisor::new(backend, pool_config, supervisor_config.backoff));
        pool.start().await;

        tracing::info!(%local_addr, "Backend started");
        Ok(Self { tunnel, pool, local_addr })
    }

    /// Query capability handed to the HTTP layer.
    pub fn query_runner(&self) -> Arc<dyn QueryRunner> {
        self.pool.clone()
    }

    /// Address the tunnel listener bound at startup.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The tunnel supervisor.
    pub fn tunnel(&self) -> &TunnelSupervisor<C> {
        &self.tunnel
    }

    /// The pool supervisor.
    pub fn pool(&self) -> &PoolSupervisor<B> {
        &self.pool
    }

    /// Close the pool, then the tunnel.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.tunnel.shutdown().await;
        tracing::info!("Backend stopped");
    }
}
