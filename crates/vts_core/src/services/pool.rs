//! PostgreSQL pooling with deadpool-postgres.
//!
//! [`DataPool`] and [`PoolBackend`] are the seams the pool supervisor is
//! written against; [`PgBackend`] is the production implementation. Runtime
//! faults are detected by a periodic health check on a pooled client.

use crate::error::VtsError;
use crate::models::{PoolConfig, Rows};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use deadpool_postgres::{
    Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime, TimeoutType,
};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_postgres::types::Type;
use tokio_postgres::NoTls;
use uuid::Uuid;

/// Liveness probe issued right after a pool is built.
pub const PROBE_SQL: &str = "SELECT 1";

/// One pool of data-store connections.
#[async_trait]
pub trait DataPool: Send + Sync + 'static {
    /// Run the liveness probe.
    async fn probe(&self) -> Result<(), VtsError>;

    /// Run a query and return its rows.
    async fn query(&self, sql: &str) -> Result<Rows, VtsError>;

    /// Resolves with the first pool-level runtime fault.
    async fn faulted(&self) -> VtsError;

    /// Close the pool. Close-time errors are not reported.
    fn close(&self);
}

/// Builds pools.
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    /// Pool type produced by this backend.
    type Pool: DataPool;

    /// Build a pool. Does not probe it.
    async fn create(&self, config: &PoolConfig) -> Result<Self::Pool, VtsError>;
}

/// The query capability handed to consumers of the core.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Run a query against the live pool, failing with
    /// [`VtsError::NotReady`] if there is none.
    async fn run_query(&self, sql: &str) -> Result<Rows, VtsError>;
}

/// deadpool-postgres backend.
pub struct PgBackend {
    health_check_interval: Duration,
}

impl PgBackend {
    /// Create a backend whose pools health-check at the given interval.
    pub fn new(health_check_interval: Duration) -> Self {
        Self { health_check_interval }
    }
}

#[async_trait]
impl PoolBackend for PgBackend {
    type Pool = PgPool;

    async fn create(&self, config: &PoolConfig) -> Result<PgPool, VtsError> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.username);
        pg_config.password(config.password.expose());
        pg_config.application_name(&config.application_name);
        pg_config.connect_timeout(config.connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .wait_timeout(Some(config.connect_timeout))
            .create_timeout(Some(config.connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| VtsError::pool_creation_with_source("Failed to build pool", e))?;

        tracing::debug!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_size = config.max_size,
            "Postgres pool built"
        );

        Ok(PgPool { pool, health_check_interval: self.health_check_interval })
    }
}

/// A deadpool-postgres pool.
pub struct PgPool {
    pool: Pool,
    health_check_interval: Duration,
}

impl PgPool {
    async fn client(&self) -> Result<deadpool_postgres::Client, PoolError> {
        self.pool.get().await
    }
}

#[async_trait]
impl DataPool for PgPool {
    async fn probe(&self) -> Result<(), VtsError> {
        let client = self
            .client()
            .await
            .map_err(|e| VtsError::pool_creation_with_source("Failed to establish connection", e))?;

        client
            .execute(PROBE_SQL, &[])
            .await
            .map_err(|e| VtsError::pool_creation_with_source("Connection validation failed", e))?;

        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Rows, VtsError> {
        let client = self
            .client()
            .await
            .map_err(|e| VtsError::query(format!("Failed to acquire connection: {e}")))?;

        let rows = client.query(sql, &[]).await.map_err(VtsError::from)?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn faulted(&self) -> VtsError {
        loop {
            tokio::time::sleep(self.health_check_interval).await;

            let client = match self.client().await {
                Ok(client) => client,
                Err(e) => match checkout_fault(e) {
                    Some(fault) => return fault,
                    None => {
                        tracing::debug!("All pooled connections busy, health check skipped");
                        continue;
                    }
                },
            };
            if let Err(e) = client.execute(PROBE_SQL, &[]).await {
                return VtsError::pool_runtime_with_source("Health check query failed", e);
            }
            tracing::trace!("Postgres pool health check passed");
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// Classify a failed health-check checkout.
///
/// Timing out while every client is checked out is load, not a fault; the
/// next tick tries again. Create, recycle and backend errors are faults.
fn checkout_fault(err: PoolError) -> Option<VtsError> {
    match err {
        PoolError::Timeout(TimeoutType::Wait) => None,
        other => Some(VtsError::pool_runtime_with_source(
            "Health check could not get a connection",
            other,
        )),
    }
}

/// Convert a PostgreSQL row to a JSON object keyed by column name.
///
/// NUMERIC is rendered as a string to keep its precision; types without a
/// dedicated mapping fall back to their text form, and anything unreadable
/// becomes `null`.
fn row_to_json(row: &tokio_postgres::Row) -> serde_json::Map<String, JsonValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| (col.name().to_string(), column_to_json(row, i, col.type_())))
        .collect()
}

fn column_to_json(row: &tokio_postgres::Row, i: usize, ty: &Type) -> JsonValue {
    match ty.clone() {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(i)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),

        Type::INT2 => row
            .try_get::<_, Option<i16>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),

        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(i)
            .ok()
            .flatten()
            .map(float4_to_json)
            .unwrap_or(JsonValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(i)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),

        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),

        Type::UUID => row
            .try_get::<_, Option<Uuid>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),

        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<JsonValue>>(i)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null),

        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<Utc>>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_rfc3339()))
            .unwrap_or(JsonValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(i)
            .ok()
            .flatten()
            .map(timestamp_to_json)
            .unwrap_or(JsonValue::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(i)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),

        _ => row
            .try_get::<_, Option<String>>(i)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

/// REAL widened straight to f64 carries binary noise (1.1 becomes
/// 1.100000023841858); go through the shortest decimal form instead.
fn float4_to_json(v: f32) -> JsonValue {
    v.to_string()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// `timestamp without time zone` is rendered as RFC 3339 in UTC.
fn timestamp_to_json(v: NaiveDateTime) -> JsonValue {
    JsonValue::String(v.and_utc().to_rfc3339())
}
