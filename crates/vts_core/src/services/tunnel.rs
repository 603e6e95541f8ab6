//! Supervised SSH tunnel.
//!
//! The session and its forwarding listener form one lifecycle unit. A fault in
//! either tears both down (listener first, then session) and, after the
//! backoff delay, a fresh pair is established. Retries are unbounded.

use crate::error::VtsError;
use crate::models::{BackoffKind, TunnelConfig, TunnelStatus};
use crate::services::forward::ForwardListener;
use crate::services::transport::{TransportConnector, TunnelTransport};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fully live session: authenticated transport plus bound listener.
///
/// Never exists half-built; [`TunnelSession::open`] releases whatever it
/// acquired if a later step fails.
struct TunnelSession<T: TunnelTransport> {
    transport: Arc<T>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl<T: TunnelTransport> TunnelSession<T> {
    async fn open<C>(inner: &Inner<C>) -> Result<Self, VtsError>
    where
        C: TransportConnector<Transport = T>,
    {
        let bind_addr = inner.config.local_addr().await?;
        let transport = Arc::new(inner.connector.connect(&inner.config).await?);

        let listener = match ForwardListener::bind(
            bind_addr,
            transport.clone(),
            &inner.config.target_host,
            inner.config.target_port,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let local_addr = listener.local_addr();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listener.run(cancel.clone()));

        Ok(Self { transport, local_addr, cancel, listener: Some(listener) })
    }

    /// Wait for the first fault of the session or its listener.
    async fn fault(&mut self) -> VtsError {
        let Some(listener) = self.listener.as_mut() else {
            self.transport.closed().await;
            return VtsError::session("SSH connection closed");
        };

        let result = tokio::select! {
            _ = self.transport.closed() => return VtsError::session("SSH connection closed"),
            result = listener => result,
        };
        self.listener = None;

        match result {
            Err(e) => VtsError::listener(format!("Tunnel listener task failed: {e}")),
            Ok(()) => VtsError::listener("Tunnel listener stopped"),
        }
    }

    /// Close the listener (and every relay), then the session.
    async fn close(mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "Tunnel listener task ended abnormally");
            }
        }
        self.transport.close().await;
    }
}

struct Inner<C: TransportConnector> {
    connector: C,
    config: TunnelConfig,
    backoff: BackoffKind,
    status: watch::Sender<TunnelStatus>,
    generation: AtomicU64,
}

impl<C: TransportConnector> Inner<C> {
    fn mark_ready(&self, local_addr: SocketAddr) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            %local_addr,
            remote = %self.config.target(),
            generation,
            "SSH tunnel ready"
        );
        self.status.send_replace(TunnelStatus::Ready { local_addr, generation });
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single tunnel session of the process.
pub struct TunnelSupervisor<C: TransportConnector> {
    inner: Arc<Inner<C>>,
    running: Mutex<Option<Running>>,
}

impl<C: TransportConnector> TunnelSupervisor<C> {
    /// Create a stopped supervisor.
    pub fn new(connector: C, config: TunnelConfig, backoff: BackoffKind) -> Self {
        let (status, _) = watch::channel(TunnelStatus::Stopped);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                backoff,
                status,
                generation: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Establish the session and listener, then keep them alive.
    ///
    /// Resolves with the bound local address once the listener accepts.
    /// Calling it while a session is live tears that session down first. A
    /// failure here is returned, not retried; faults after success are
    /// handled internally with unbounded backoff.
    pub async fn start(&self) -> Result<SocketAddr, VtsError> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            tracing::info!("Closing old tunnel before restart");
            previous.stop().await;
        }

        self.inner.status.send_replace(TunnelStatus::Connecting);
        let session = match TunnelSession::open(&*self.inner).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(fault = e.category(), error = %e, "SSH tunnel failed to start");
                self.inner.status.send_replace(TunnelStatus::Stopped);
                return Err(e);
            }
        };

        let local_addr = session.local_addr;
        self.inner.mark_ready(local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(self.inner.clone(), session, cancel.clone()));
        *running = Some(Running { cancel, task });

        Ok(local_addr)
    }

    /// Tear down the live session and stop retrying.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.stop().await;
        }
        self.inner.status.send_replace(TunnelStatus::Stopped);
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.inner.status.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> TunnelStatus {
        self.inner.status.borrow().clone()
    }
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Tunnel supervisor task ended abnormally");
        }
    }
}

/// Restart loop: wait for a fault, tear down, back off, re-establish.
async fn supervise<C: TransportConnector>(
    inner: Arc<Inner<C>>,
    mut session: TunnelSession<C::Transport>,
    cancel: CancellationToken,
) {
    let mut backoff = inner.backoff.build();

    loop {
        let fault = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                session.close().await;
                tracing::info!("SSH tunnel closed");
                return;
            }
            fault = session.fault() => fault,
        };

        tracing::error!(fault = fault.category(), error = %fault, "SSH tunnel lost");
        session.close().await;
        tracing::info!("SSH tunnel closed");

        session = loop {
            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            inner.status.send_replace(TunnelStatus::Reconnecting { attempt, delay });
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting SSH");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            inner.status.send_replace(TunnelStatus::Connecting);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = TunnelSession::open(&*inner) => result,
            };

            match result {
                Ok(session) => break session,
                Err(e) => {
                    tracing::error!(
                        fault = e.category(),
                        attempt,
                        error = %e,
                        "SSH tunnel reconnect failed"
                    );
                }
            }
        };

        backoff.reset();
        inner.mark_ready(session.local_addr);
    }
}
