//! Error types for the connection-resilience core.
//!
//! Every variant corresponds to one fault class. The supervisors decide what
//! to do with a fault (retry, terminate one relay, surface to the caller) by
//! its variant, and log it with [`VtsError::category`] as a structured field.

use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for the core.
#[derive(Debug, Error)]
pub enum VtsError {
    /// SSH session could not be established or was lost.
    #[error("Session error: {message}")]
    Session {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// Local forwarding listener could not be bound.
    #[error("Listener error: {message}")]
    Listener {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A single forwarded stream could not be opened.
    #[error("Forward error: {message}")]
    Forward {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A new pool failed to build or failed its liveness probe.
    #[error("Pool creation error: {message}")]
    PoolCreation {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A live pool reported a fault after it was marked ready.
    #[error("Pool runtime error: {message}")]
    PoolRuntime {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// Query execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// No live pool exists at call time.
    #[error("Database connection not ready")]
    NotReady,

    /// First-ever tunnel establishment failed; the process must not serve.
    #[error("Startup failed: {source}")]
    Startup {
        /// The fault that aborted startup.
        #[source]
        source: Box<VtsError>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },
}

impl VtsError {
    // ========== Constructors ==========

    /// Create a new session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session { message: message.into(), source: None }
    }

    /// Create a new session error with source.
    pub fn session_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Session { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new listener error.
    pub fn listener(message: impl Into<String>) -> Self {
        Self::Listener { message: message.into(), source: None }
    }

    /// Create a new listener error with source.
    pub fn listener_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Listener { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new forward error.
    pub fn forward(message: impl Into<String>) -> Self {
        Self::Forward { message: message.into(), source: None }
    }

    /// Create a new forward error with source.
    pub fn forward_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Forward { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new pool creation error.
    pub fn pool_creation(message: impl Into<String>) -> Self {
        Self::PoolCreation { message: message.into(), source: None }
    }

    /// Create a new pool creation error with source.
    pub fn pool_creation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PoolCreation { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new pool runtime error.
    pub fn pool_runtime(message: impl Into<String>) -> Self {
        Self::PoolRuntime { message: message.into(), source: None }
    }

    /// Create a new pool runtime error with source.
    pub fn pool_runtime_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::PoolRuntime { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, code: None }
    }

    /// Wrap the fault that aborted the first tunnel establishment.
    pub fn startup(source: VtsError) -> Self {
        Self::Startup { source: Box::new(source) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error means no live pool was available.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }

    /// Get the fault category name, used as the `fault` log field.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Session { .. } => "SessionFault",
            Self::Listener { .. } => "ListenerFault",
            Self::Forward { .. } => "ForwardFault",
            Self::PoolCreation { .. } => "PoolCreationFault",
            Self::PoolRuntime { .. } => "PoolRuntimeFault",
            Self::Query { .. } => "QueryFault",
            Self::NotReady => "NotReady",
            Self::Startup { .. } => "FatalFault",
            Self::Config { .. } => "Config",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Session { .. } => Some("Check the SSH host, port and credentials"),
            Self::Listener { .. } => Some("Check that the local tunnel port is free"),
            Self::Forward { .. } => Some("The SSH server may not allow TCP forwarding"),
            Self::PoolCreation { .. } => Some("Check the database credentials and tunnel target"),
            Self::PoolRuntime { .. } => None,
            Self::Query { hint, .. } => hint.as_deref(),
            Self::NotReady => Some("The pool is being recreated, retry shortly"),
            Self::Startup { source } => source.hint(),
            Self::Config { .. } => None,
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to VtsError.
///
/// Always a query-scoped fault: pool-level faults are raised by the pool's
/// own health check, never inferred from a single failed query.
impl From<tokio_postgres::Error> for VtsError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            return VtsError::Query {
                message: db_err.message().to_string(),
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                code: Some(db_err.code().code().to_string()),
            };
        }

        if err.is_closed() {
            return VtsError::query("Connection closed");
        }

        VtsError::Query { message: err.to_string(), detail: None, hint: None, code: None }
    }
}
