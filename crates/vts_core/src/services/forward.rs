//! Local TCP listener that relays every accepted connection through a
//! session to a fixed target.

use crate::error::VtsError;
use crate::services::transport::{BoxedStream, TunnelTransport};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Relay buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Pause after a failed `accept()` (e.g. EMFILE) before accepting again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bound listener forwarding to `target_host:target_port` through one
/// session.
pub struct ForwardListener<T: TunnelTransport> {
    listener: TcpListener,
    local_addr: SocketAddr,
    transport: Arc<T>,
    target_host: Arc<str>,
    target_port: u16,
}

impl<T: TunnelTransport> ForwardListener<T> {
    /// Bind the local listener.
    pub async fn bind(
        addr: SocketAddr,
        transport: Arc<T>,
        target_host: &str,
        target_port: u16,
    ) -> Result<Self, VtsError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            VtsError::listener_with_source(format!("Failed to bind tunnel listener on {addr}"), e)
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            VtsError::listener_with_source("Failed to read tunnel listener address", e)
        })?;

        Ok(Self {
            listener,
            local_addr,
            transport,
            target_host: Arc::from(target_host),
            target_port,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and relay connections until `cancel` fires.
    ///
    /// On return the listening socket is closed and every relay it started
    /// has been aborted, so all relayed sockets are closed too.
    pub async fn run(self, cancel: CancellationToken) {
        let mut relays = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((local_stream, peer_addr)) => {
                            tracing::debug!(peer = %peer_addr, "New tunnel connection");
                            relays.spawn(relay(
                                local_stream,
                                peer_addr,
                                self.transport.clone(),
                                self.target_host.clone(),
                                self.target_port,
                            ));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept tunnel connection");
                            if !pause_after_accept_error(&cancel).await {
                                break;
                            }
                        }
                    }
                }
                Some(_) = relays.join_next(), if !relays.is_empty() => {}
            }
        }

        let open_relays = relays.len();
        drop(self.listener);
        relays.shutdown().await;
        tracing::debug!(
            local_addr = %self.local_addr,
            closed_relays = open_relays,
            "Tunnel listener closed"
        );
    }
}

/// Wait out [`ACCEPT_RETRY_DELAY`]. Returns `false` if cancelled meanwhile.
async fn pause_after_accept_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// Open the remote end for one local connection and splice the two.
///
/// A failed open closes the local connection straight away; no retry here.
async fn relay<T: TunnelTransport>(
    local_stream: TcpStream,
    peer_addr: SocketAddr,
    transport: Arc<T>,
    target_host: Arc<str>,
    target_port: u16,
) {
    let remote_stream = match transport.open_stream(&target_host, target_port, peer_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                fault = e.category(),
                peer = %peer_addr,
                error = %e,
                "Tunnel forwarding error, closing local connection"
            );
            return;
        }
    };

    let (sent, received) = splice(local_stream, remote_stream).await;
    tracing::debug!(peer = %peer_addr, sent, received, "Tunnel connection finished");
}

/// Copy bytes both ways until either side reaches end-of-stream or errors,
/// then shut both down. Returns (local→remote, remote→local) byte counts.
async fn splice(mut local_stream: TcpStream, mut remote_stream: BoxedStream) -> (u64, u64) {
    let mut buf_local = [0u8; RELAY_BUFFER_SIZE];
    let mut buf_remote = [0u8; RELAY_BUFFER_SIZE];
    let mut sent = 0u64;
    let mut received = 0u64;

    loop {
        tokio::select! {
            n = local_stream.read(&mut buf_local) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if remote_stream.write_all(&buf_local[..n]).await.is_err() {
                            break;
                        }
                        sent += n as u64;
                    }
                }
            }
            n = remote_stream.read(&mut buf_remote) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                            break;
                        }
                        received += n as u64;
                    }
                }
            }
        }
    }

    let _ = local_stream.shutdown().await;
    let _ = remote_stream.shutdown().await;
    (sent, received)
}
