use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::{handlers::AppState, telemetry::PipelineStatus};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub rate_limiting: bool,
    pub pipeline: PipelineStatus,
}

/// Handle `GET /health`
///
/// Reports 503 once the flusher has stopped, since events can no longer be persisted.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pipeline = state.pipeline.status();
    let running = pipeline.flusher_state != crate::telemetry::FlusherState::Stopped;

    let (code, status) = if running {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stopped")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            rate_limiting: state.limiter.is_some(),
            pipeline,
        }),
    )
}
