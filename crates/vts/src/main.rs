//! VTS backend
//!
//! Serves vehicle telemetry from a PostgreSQL database that is only
//! reachable through an SSH tunnel. The tunnel and the pool are supervised by
//! `vts_core` and re-established on any fault; only the very first tunnel
//! establishment can stop the process.

mod http_api;

use crate::http_api::{router, AppState};
use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;
use vts_core::logging::{init_logging, LogConfig};
use vts_core::{
    BackoffKind, LiveOrchestrator, PoolConfig, Secret, SshAuth, SshEndpoint, SupervisorConfig,
    TunnelConfig,
};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffArg {
    Fixed,
    Exponential,
}

#[derive(Parser, Debug)]
#[command(name = "vts")]
#[command(about = "VTS backend - vehicle telemetry over a supervised SSH tunnel")]
struct Args {
    /// SSH server host
    #[arg(long, env = "SSH_HOST")]
    ssh_host: String,

    /// SSH server port
    #[arg(long, env = "SSH_PORT", default_value = "22")]
    ssh_port: u16,

    /// SSH username
    #[arg(long, env = "SSH_USERNAME")]
    ssh_username: String,

    /// SSH password (ignored when a key file is given)
    #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// SSH private key file
    #[arg(long, env = "SSH_KEY_PATH")]
    ssh_key_path: Option<PathBuf>,

    /// Passphrase of the SSH private key
    #[arg(long, env = "SSH_KEY_PASSPHRASE", hide_env_values = true)]
    ssh_key_passphrase: Option<String>,

    /// Host the SSH server forwards to
    #[arg(long, env = "TUNNEL_REMOTE_HOST", default_value = "127.0.0.1")]
    tunnel_remote_host: String,

    /// Port the SSH server forwards to
    #[arg(long, env = "TUNNEL_REMOTE_PORT", default_value = "5432")]
    tunnel_remote_port: u16,

    /// Local tunnel bind host (IP address or resolvable name)
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "127.0.0.1")]
    tunnel_local_host: String,

    /// Local tunnel bind port
    #[arg(long, env = "TUNNEL_LOCAL_PORT", default_value = "55432")]
    tunnel_local_port: u16,

    /// Database user
    #[arg(long, env = "DB_USER")]
    db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: String,

    /// Database name
    #[arg(long, env = "DB_NAME")]
    db_name: String,

    /// Maximum pooled database connections
    #[arg(long, env = "POOL_MAX_SIZE", default_value = "8")]
    pool_max_size: usize,

    /// Seconds between pool health checks
    #[arg(long, env = "POOL_HEALTH_INTERVAL_SECS", default_value = "10")]
    pool_health_interval_secs: u64,

    /// HTTP port
    #[arg(long, env = "HTTP_PORT", default_value = "3001")]
    http_port: u16,

    /// Allowed CORS origins, comma separated; `*` allows any
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = "http://localhost:3000")]
    cors_allowed_origins: String,

    /// Backoff policy between restarts
    #[arg(long, env = "BACKOFF", value_enum, default_value = "fixed")]
    backoff: BackoffArg,

    /// Delay before a restart (initial delay for exponential backoff)
    #[arg(long, env = "RETRY_DELAY_SECS", default_value = "5")]
    retry_delay_secs: u64,

    /// Upper bound on the exponential backoff delay
    #[arg(long, env = "RETRY_MAX_DELAY_SECS", default_value = "60")]
    retry_max_delay_secs: u64,

    /// Seconds allowed for SSH connect and authentication
    #[arg(long, env = "SSH_READY_TIMEOUT_SECS", default_value = "20")]
    ssh_ready_timeout_secs: u64,

    /// Directory for daily rotated log files
    #[arg(long, env = "VTS_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn ssh_auth(&self) -> anyhow::Result<SshAuth> {
        if let Some(path) = &self.ssh_key_path {
            return Ok(SshAuth::KeyFile {
                path: path.to_string_lossy().into_owned(),
                passphrase: self.ssh_key_passphrase.clone().map(Secret::new),
            });
        }
        match &self.ssh_password {
            Some(password) => Ok(SshAuth::Password(Secret::new(password.clone()))),
            None => anyhow::bail!("Either SSH_PASSWORD or SSH_KEY_PATH must be set"),
        }
    }

    fn tunnel_config(&self) -> anyhow::Result<TunnelConfig> {
        let ssh = SshEndpoint {
            host: self.ssh_host.clone(),
            port: self.ssh_port,
            username: self.ssh_username.clone(),
            auth: self.ssh_auth()?,
        };
        Ok(TunnelConfig::new(ssh, self.tunnel_remote_host.clone(), self.tunnel_remote_port)
            .with_local(self.tunnel_local_host.clone(), self.tunnel_local_port))
    }

    fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new(
            self.db_name.clone(),
            self.db_user.clone(),
            Secret::new(self.db_password.clone()),
        );
        config.max_size = self.pool_max_size;
        config
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let backoff = match self.backoff {
            BackoffArg::Fixed => BackoffKind::Fixed(delay),
            BackoffArg::Exponential => BackoffKind::Exponential {
                initial: delay,
                max: Duration::from_secs(self.retry_max_delay_secs).max(delay),
            },
        };
        SupervisorConfig {
            backoff,
            ready_timeout: Duration::from_secs(self.ssh_ready_timeout_secs),
            health_check_interval: Duration::from_secs(self.pool_health_interval_secs),
            ..SupervisorConfig::default()
        }
    }

    fn cors_layer(&self) -> anyhow::Result<CorsLayer> {
        let origins: Vec<&str> = self
            .cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .collect();

        let allow_origin = if origins.contains(&"*") {
            AllowOrigin::any()
        } else {
            let values = origins
                .iter()
                .map(|origin| {
                    HeaderValue::from_str(origin)
                        .with_context(|| format!("Invalid CORS origin: {origin}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            AllowOrigin::list(values)
        };

        Ok(CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET])
            .allow_headers(Any))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut log_config = LogConfig::new();
    if let Some(log_dir) = &args.log_dir {
        log_config = log_config.with_log_dir(log_dir);
    }
    let log_guard = init_logging(log_config);

    let tunnel_config = args.tunnel_config()?;
    let pool_config = args.pool_config();
    let supervisor_config = args.supervisor_config();
    let cors = args.cors_layer()?;

    info!("Starting VTS backend");
    info!("  SSH: {}@{}:{}", args.ssh_username, args.ssh_host, args.ssh_port);
    info!(
        "  Tunnel: {}:{} -> {}",
        args.tunnel_local_host,
        args.tunnel_local_port,
        tunnel_config.target()
    );
    info!("  HTTP port: {}", args.http_port);
    if let Some(log_dir) = args.log_dir.as_ref().filter(|_| log_guard.has_file_output()) {
        info!("  Log dir: {}", log_dir.display());
    }

    // A failure here exits with status 1 before any HTTP listener exists.
    let orchestrator =
        LiveOrchestrator::start_live(tunnel_config, pool_config, supervisor_config)
            .await
            .context("Failed to start server")?;

    let app = router(AppState { queries: orchestrator.query_runner() }, cors);
    let http_addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {http_addr}"))?;

    info!("Backend live at http://localhost:{}", args.http_port);

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    info!("Shutting down VTS backend");
    orchestrator.shutdown().await;

    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
