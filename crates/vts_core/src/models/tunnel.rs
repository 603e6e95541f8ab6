//! SSH tunnel configuration.

use crate::error::VtsError;
use std::fmt;
use std::net::SocketAddr;

/// Default local bind host for the tunnel listener.
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

/// Default local bind port for the tunnel listener.
pub const DEFAULT_LOCAL_PORT: u16 = 55432;

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the raw credential for handing to a client library.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if the credential is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Password authentication
    Password(Secret),
    /// Private key file authentication
    KeyFile {
        /// Path to the private key file
        path: String,
        /// Passphrase if the key is encrypted
        passphrase: Option<Secret>,
    },
}

/// Remote SSH server the session is opened against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default: 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth: SshAuth,
}

/// Immutable description of one tunnel: session endpoint, forward target and
/// local bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Where the SSH session goes
    pub ssh: SshEndpoint,
    /// Host the SSH server forwards to (seen from the SSH server)
    pub target_host: String,
    /// Port the SSH server forwards to
    pub target_port: u16,
    /// Local address the forwarding listener binds
    pub local_host: String,
    /// Local port the forwarding listener binds (0 picks a free port)
    pub local_port: u16,
}

impl TunnelConfig {
    /// Create a tunnel configuration with the default local bind address.
    pub fn new(ssh: SshEndpoint, target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            ssh,
            target_host: target_host.into(),
            target_port,
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            local_port: DEFAULT_LOCAL_PORT,
        }
    }

    /// Override the local bind address.
    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = host.into();
        self.local_port = port;
        self
    }

    /// Resolve the local bind address. Hostnames such as `localhost` are
    /// looked up and the first address is used.
    pub async fn local_addr(&self) -> Result<SocketAddr, VtsError> {
        let host = self.local_host.as_str();
        let mut addrs = tokio::net::lookup_host((host, self.local_port))
            .await
            .map_err(|e| VtsError::config(format!("Invalid local bind host {host}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| VtsError::config(format!("Local bind host {host} has no address")))
    }

    /// `host:port` of the forward target, for logging.
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Validate the tunnel configuration.
    pub fn validate(&self) -> Result<(), VtsError> {
        if self.ssh.host.trim().is_empty() {
            return Err(VtsError::config("SSH host is required"));
        }
        if self.ssh.port == 0 {
            return Err(VtsError::config("SSH port must be between 1 and 65535"));
        }
        if self.ssh.username.trim().is_empty() {
            return Err(VtsError::config("SSH username is required"));
        }
        match &self.ssh.auth {
            SshAuth::Password(secret) if secret.is_empty() => {
                return Err(VtsError::config("SSH password is required"));
            }
            SshAuth::KeyFile { path, .. } if path.trim().is_empty() => {
                return Err(VtsError::config("SSH key path is required"));
            }
            _ => {}
        }
        if self.target_host.trim().is_empty() {
            return Err(VtsError::config("Forward target host is required"));
        }
        if self.target_port == 0 {
            return Err(VtsError::config("Forward target port must be between 1 and 65535"));
        }
        if self.local_host.trim().is_empty() {
            return Err(VtsError::config("Local bind host is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            host: "bastion.example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            auth: SshAuth::Password(Secret::new("hunter2")),
        }
    }

    #[tokio::test]
    async fn test_defaults_bind_loopback_55432() {
        let config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432);
        assert_eq!(config.local_addr().await.unwrap(), "127.0.0.1:55432".parse().unwrap());
        assert_eq!(config.target(), "127.0.0.1:5432");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432);
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Secret(***)"));
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432);
        config.ssh.username = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432);
        config.ssh.auth = SshAuth::Password(Secret::new(""));
        assert!(config.validate().is_err());

        let config = TunnelConfig::new(endpoint(), "127.0.0.1", 0);
        assert!(config.validate().is_err());

        let config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432).with_local(" ", 1);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_local_host_name_is_resolved() {
        let config =
            TunnelConfig::new(endpoint(), "127.0.0.1", 5432).with_local("localhost", 55432);
        assert!(config.validate().is_ok());
        let addr = config.local_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 55432);

        let config = TunnelConfig::new(endpoint(), "127.0.0.1", 5432).with_local("not a host", 1);
        let err = config.local_addr().await.unwrap_err();
        assert_eq!(err.category(), "Config");
    }
}
