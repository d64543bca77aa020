use crate::constants::UPSTREAM_FAILURE_STREAK_LIMIT;
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub upstream: String,
    pub consecutive_failures: u32,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;
    if let Err(e) = state.store.ping().await {
        tracing::error!("Readiness check: store error: {}", e);
        db_ok = false;
    }

    let failures = state.health.consecutive_failures();
    let upstream_ok = failures < UPSTREAM_FAILURE_STREAK_LIMIT;
    if !upstream_ok {
        tracing::warn!("Readiness check: upstream failed {} times in a row", failures);
    }

    let ready = db_ok && upstream_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            upstream: if upstream_ok { "ok" } else { "failing" }.to_string(),
            consecutive_failures: failures,
        }),
    )
}
