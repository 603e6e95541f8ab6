//! Supervised PostgreSQL pool.
//!
//! A single task owns the pool lifecycle: build, probe, publish, wait for a
//! runtime fault, retire, back off, repeat. Probe failures and runtime faults
//! feed the same loop, so there is only ever one pending recreation.

use crate::error::VtsError;
use crate::models::{BackoffKind, PoolConfig, PoolState, Rows};
use crate::services::pool::{DataPool, PoolBackend, QueryRunner};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Inner<B: PoolBackend> {
    backend: B,
    config: PoolConfig,
    backoff: BackoffKind,
    /// The live pool; `None` whenever the pool is not marked live.
    live: RwLock<Option<Arc<B::Pool>>>,
    state: watch::Sender<PoolState>,
    generation: AtomicU64,
}

impl<B: PoolBackend> Inner<B> {
    /// Build a pool and probe it.
    ///
    /// A pool that fails its probe, or is still probing when `cancel` fires,
    /// is closed before returning. `Ok(None)` means cancelled.
    async fn create_live(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<B::Pool>>, VtsError> {
        let pool = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            pool = self.backend.create(&self.config) => pool?,
        };

        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            probed = pool.probe() => Some(probed),
        };
        match probed {
            Some(Ok(())) => Ok(Some(Arc::new(pool))),
            Some(Err(e)) => {
                pool.close();
                Err(match e {
                    VtsError::PoolCreation { .. } => e,
                    other => VtsError::pool_creation(format!("Liveness probe failed: {other}")),
                })
            }
            None => {
                pool.close();
                Ok(None)
            }
        }
    }

    fn publish(&self, pool: Arc<B::Pool>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.live.write() = Some(pool);
        self.state.send_replace(PoolState::Ready { generation });
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            generation,
            "Postgres pool connected"
        );
    }

    /// Unpublish and close the live pool, ignoring close-time errors.
    fn retire(&self) {
        let retired = self.live.write().take();
        if let Some(pool) = retired {
            pool.close();
            tracing::info!("Closed old Postgres pool");
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Pool supervisor task ended abnormally");
        }
    }
}

/// Owns the single data-store pool of the process.
pub struct PoolSupervisor<B: PoolBackend> {
    inner: Arc<Inner<B>>,
    running: Mutex<Option<Running>>,
}

impl<B: PoolBackend> PoolSupervisor<B> {
    /// Create a stopped supervisor.
    pub fn new(backend: B, config: PoolConfig, backoff: BackoffKind) -> Self {
        let (state, _) = watch::channel(PoolState::Stopped);
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                backoff,
                live: RwLock::new(None),
                state,
                generation: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the creation loop and return without waiting for readiness.
    ///
    /// A previous loop and its pool are torn down first. Use
    /// [`PoolSupervisor::subscribe`] to learn when the pool is live.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.stop().await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(self.inner.clone(), cancel.clone()));
        *running = Some(Running { cancel, task });
    }

    /// Close the pool and stop recreating it.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.stop().await;
        }
        self.inner.retire();
        self.inner.state.send_replace(PoolState::Stopped);
    }

    /// Run a query against the live pool.
    ///
    /// Fails immediately with [`VtsError::NotReady`] when no pool is live.
    /// A failing query never triggers pool recreation.
    pub async fn run_query(&self, sql: &str) -> Result<Rows, VtsError> {
        let pool = self.inner.live.read().clone().ok_or(VtsError::NotReady)?;

        pool.query(sql).await.map_err(|e| {
            tracing::error!(
                fault = e.category(),
                code = e.pg_code().unwrap_or_default(),
                hint = e.hint().unwrap_or_default(),
                error = %e,
                "Database error"
            );
            e
        })
    }

    /// Check if a pool is live.
    pub fn is_ready(&self) -> bool {
        self.inner.live.read().is_some()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<PoolState> {
        self.inner.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> PoolState {
        self.inner.state.borrow().clone()
    }
}

#[async_trait]
impl<B: PoolBackend> QueryRunner for PoolSupervisor<B> {
    async fn run_query(&self, sql: &str) -> Result<Rows, VtsError> {
        PoolSupervisor::run_query(self, sql).await
    }
}

async fn supervise<B: PoolBackend>(inner: Arc<Inner<B>>, cancel: CancellationToken) {
    let mut backoff = inner.backoff.build();

    loop {
        inner.retire();
        inner.state.send_replace(PoolState::Creating);

        match inner.create_live(&cancel).await {
            Ok(None) => return,
            Ok(Some(pool)) => {
                backoff.reset();
                inner.publish(pool.clone());

                let fault = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    fault = pool.faulted() => fault,
                };
                tracing::error!(fault = fault.category(), error = %fault, "Postgres pool error");
                inner.retire();
            }
            Err(e) => {
                tracing::error!(fault = e.category(), error = %e, "Postgres connection error");
            }
        }

        let delay = backoff.next_delay();
        let attempt = backoff.attempt();
        inner.state.send_replace(PoolState::Recreating { attempt, delay });
        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Recreating Postgres pool after backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
