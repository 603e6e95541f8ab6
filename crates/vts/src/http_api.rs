//! HTTP routes over the core's query capability.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};
use vts_core::QueryRunner;

/// Latest telemetry rows, newest first.
pub const VEHICLE_DATA_SQL: &str = "\
SELECT imei, timestamp, priority, latitude, longitude, altitude, angle, satellites, speed, \
voltage, current, soc, \
max_cell_voltage, max_cell_id, min_cell_voltage, min_cell_id, \
max_temp, max_temp_cell, min_temp, min_temp_cell, \
cv1, cv2, cv3, cv4, cv5, cv6, cv7, cv8, cv9, cv10, \
cv11, cv12, cv13, cv14, cv15, cv16, cv17, cv18, \
created_at \
FROM imei_data \
ORDER BY timestamp DESC \
LIMIT 50000";

const ROOT_MESSAGE: &str = "Backend running and SSH tunnel established.";
const NOT_READY_MESSAGE: &str = "Database connection not ready.";
const FETCH_FAILED_MESSAGE: &str = "Failed to fetch vehicle data";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<dyn QueryRunner>,
}

/// Root status message
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub message: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
}

/// Build the router.
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/vehicle-data", get(vehicle_data))
        .layer(cors)
        .with_state(state)
}

/// Service status
pub async fn root() -> Json<StatusResponse> {
    Json(StatusResponse { message: ROOT_MESSAGE })
}

/// Latest vehicle telemetry
pub async fn vehicle_data(State(state): State<AppState>) -> Response {
    match state.queries.run_query(VEHICLE_DATA_SQL).await {
        Ok(rows) => {
            debug!(rows = rows.len(), "Vehicle data fetched");
            (StatusCode::OK, Json(rows)).into_response()
        }
        Err(e) if e.is_not_ready() => {
            warn!(fault = e.category(), "Vehicle data requested before the pool is live");
            (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { error: NOT_READY_MESSAGE }))
                .into_response()
        }
        Err(e) => {
            error!(fault = e.category(), error = %e, "Database error");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: FETCH_FAILED_MESSAGE }))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;
    use vts_core::{Rows, VtsError};

    enum Outcome {
        Rows(usize),
        NotReady,
        Fails,
    }

    struct FakeRunner {
        outcome: Outcome,
        seen: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self { outcome, seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl QueryRunner for FakeRunner {
        async fn run_query(&self, sql: &str) -> Result<Rows, VtsError> {
            self.seen.lock().unwrap().push(sql.to_string());
            match self.outcome {
                Outcome::Rows(n) => Ok((0..n)
                    .map(|i| {
                        let mut row = serde_json::Map::new();
                        row.insert("imei".into(), serde_json::json!("356307042441013"));
                        row.insert("timestamp".into(), serde_json::json!(1_700_000_000 - i as i64));
                        row
                    })
                    .collect()),
                Outcome::NotReady => Err(VtsError::NotReady),
                Outcome::Fails => Err(VtsError::query("relation \"imei_data\" does not exist")),
            }
        }
    }

    async fn get(runner: Arc<FakeRunner>, uri: &str) -> (StatusCode, serde_json::Value) {
        let app = router(AppState { queries: runner }, CorsLayer::new());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_root_reports_running() {
        let (status, body) = get(FakeRunner::new(Outcome::Rows(0)), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], ROOT_MESSAGE);
    }

    #[tokio::test]
    async fn test_vehicle_data_returns_rows_newest_first() {
        let runner = FakeRunner::new(Outcome::Rows(3));
        let (status, body) = get(runner.clone(), "/api/vehicle-data").await;

        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0]["timestamp"].as_i64() > rows[2]["timestamp"].as_i64());

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("FROM imei_data"));
        assert!(seen[0].ends_with("ORDER BY timestamp DESC LIMIT 50000"));
    }

    #[tokio::test]
    async fn test_vehicle_data_not_ready_is_503() {
        let (status, body) = get(FakeRunner::new(Outcome::NotReady), "/api/vehicle-data").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, serde_json::json!({ "error": "Database connection not ready." }));
    }

    #[tokio::test]
    async fn test_vehicle_data_query_failure_is_500() {
        let (status, body) = get(FakeRunner::new(Outcome::Fails), "/api/vehicle-data").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, serde_json::json!({ "error": "Failed to fetch vehicle data" }));
    }

    #[test]
    fn test_vehicle_query_selects_every_cell_voltage() {
        for i in 1..=18 {
            assert!(VEHICLE_DATA_SQL.contains(&format!("cv{i},")));
        }
        assert!(VEHICLE_DATA_SQL.contains("created_at FROM imei_data"));
    }
}
