//! Liveness handler.

use axum::Json;
use serde::Serialize;

/// Response for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Liveness probe.
///
/// Does not check dependencies; the key set and decision service are
/// reached lazily per request.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}
