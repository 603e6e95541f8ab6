//! Encrypted session transport.
//!
//! A [`TunnelTransport`] is one authenticated session that can open byte
//! streams to a (host, port) on the far side. [`TransportConnector`] produces
//! them. The SSH implementation uses russh with password or key file
//! authentication and `direct-tcpip` channels.

use crate::error::VtsError;
use crate::models::{SshAuth, SshEndpoint, SupervisorConfig, TunnelConfig};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// How often a session is checked for having gone away.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A bidirectional byte stream carried by a session.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Boxed stream returned by [`TunnelTransport::open_stream`].
pub type BoxedStream = Box<dyn RelayStream>;

/// One live encrypted session.
#[async_trait]
pub trait TunnelTransport: Send + Sync + 'static {
    /// Open a stream to `host:port` through the session.
    ///
    /// `originator` is the local peer the stream is opened on behalf of.
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, VtsError>;

    /// Resolves once the session is gone (remote close, network error,
    /// keepalive failure).
    async fn closed(&self);

    /// Close the session. Safe to call more than once.
    async fn close(&self);
}

/// Opens sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Transport: TunnelTransport;

    /// Open and authenticate a session for the given tunnel.
    async fn connect(&self, config: &TunnelConfig) -> Result<Self::Transport, VtsError>;
}

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against a pinned host key once one is provisioned in config
        Ok(true)
    }
}

/// Opens SSH sessions with keepalives and a readiness timeout.
pub struct SshConnector {
    ready_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_max: usize,
}

impl SshConnector {
    /// Create a connector from the supervisor timing configuration.
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: config.keepalive_max,
        }
    }

    /// Connect to the SSH server and authenticate.
    async fn connect_ssh(
        &self,
        endpoint: &SshEndpoint,
    ) -> Result<client::Handle<SshClientHandler>, VtsError> {
        let config = client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        };
        let config = Arc::new(config);

        let mut handle = client::connect(
            config,
            (endpoint.host.as_str(), endpoint.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| {
            VtsError::session_with_source(
                format!("Failed to connect to SSH server {}:{}", endpoint.host, endpoint.port),
                e,
            )
        })?;

        let authenticated = match &endpoint.auth {
            SshAuth::Password(password) => handle
                .authenticate_password(endpoint.username.as_str(), password.expose())
                .await
                .map_err(|e| {
                    VtsError::session_with_source("SSH password authentication failed", e)
                })?,
            SshAuth::KeyFile { path, passphrase } => {
                let key =
                    Self::load_private_key(path, passphrase.as_ref().map(|p| p.expose())).await?;
                handle
                    .authenticate_publickey(endpoint.username.as_str(), key)
                    .await
                    .map_err(|e| VtsError::session_with_source("SSH key authentication failed", e))?
            }
        };

        if !authenticated {
            return Err(VtsError::session(format!(
                "SSH authentication rejected for {}@{}",
                endpoint.username, endpoint.host
            )));
        }

        tracing::info!(
            username = %endpoint.username,
            host = %endpoint.host,
            "SSH authentication successful"
        );

        Ok(handle)
    }

    /// Load a private key from a file.
    async fn load_private_key(
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<Arc<KeyPair>, VtsError> {
        let key_data = tokio::fs::read(path).await.map_err(|e| {
            VtsError::session_with_source(format!("Failed to read SSH key file {path}"), e)
        })?;

        let key = russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
            .map_err(|e| {
                if passphrase.is_some() {
                    VtsError::session_with_source("Failed to decrypt SSH key", e)
                } else {
                    VtsError::session_with_source("Failed to parse SSH key", e)
                }
            })?;

        Ok(Arc::new(key))
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self, config: &TunnelConfig) -> Result<SshTransport, VtsError> {
        tracing::info!(
            host = %config.ssh.host,
            port = config.ssh.port,
            "Establishing SSH session"
        );

        let handle = tokio::time::timeout(self.ready_timeout, self.connect_ssh(&config.ssh))
            .await
            .map_err(|_| {
                VtsError::session(format!("SSH session not ready after {:?}", self.ready_timeout))
            })??;

        Ok(SshTransport { handle })
    }
}

/// A live SSH session.
pub struct SshTransport {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, VtsError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| {
                let message = format!("Failed to open SSH channel to {host}:{port}");
                VtsError::forward_with_source(message, e)
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn closed(&self) {
        while !self.handle.is_closed() {
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel restart", "en")
            .await
        {
            tracing::debug!(error = %e, "SSH disconnect failed, session already gone");
        }
    }
}
