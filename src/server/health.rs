//! Liveness probe.

use axum::http::StatusCode;

/// `GET /health` - answers 200 while the process is serving.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
