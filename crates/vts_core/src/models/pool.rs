//! PostgreSQL pool configuration.

use crate::error::VtsError;
use crate::models::tunnel::Secret;
use std::net::SocketAddr;
use std::time::Duration;

/// Query result rows, each a JSON object keyed by column name.
pub type Rows = Vec<serde_json::Map<String, serde_json::Value>>;

/// Immutable description of the data-store pool.
///
/// Host and port always point at the tunnel's local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Host of the local tunnel endpoint
    pub host: String,
    /// Port of the local tunnel endpoint
    pub port: u16,
    /// Database name
    pub database: String,
    /// Authentication username
    pub username: String,
    /// Authentication password
    pub password: Secret,
    /// Maximum number of pooled connections
    pub max_size: usize,
    /// Timeout for establishing one connection
    pub connect_timeout: Duration,
    /// Application name reported to PostgreSQL
    pub application_name: String,
}

impl PoolConfig {
    /// Create a pool configuration with default sizing.
    pub fn new(
        database: impl Into<String>,
        username: impl Into<String>,
        password: Secret,
    ) -> Self {
        Self {
            host: super::tunnel::DEFAULT_LOCAL_HOST.to_string(),
            port: super::tunnel::DEFAULT_LOCAL_PORT,
            database: database.into(),
            username: username.into(),
            password,
            max_size: 8,
            connect_timeout: Duration::from_secs(10),
            application_name: "vts".to_string(),
        }
    }

    /// Point the pool at the address the tunnel listener actually bound.
    pub fn through(mut self, local_addr: SocketAddr) -> Self {
        self.host = local_addr.ip().to_string();
        self.port = local_addr.port();
        self
    }

    /// Validate the pool configuration.
    pub fn validate(&self) -> Result<(), VtsError> {
        if self.database.trim().is_empty() {
            return Err(VtsError::config("Database name is required"));
        }
        if self.username.trim().is_empty() {
            return Err(VtsError::config("Database username is required"));
        }
        if self.max_size == 0 {
            return Err(VtsError::config("Pool size must be at least 1"));
        }
        Ok(())
    }
}
