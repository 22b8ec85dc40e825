use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::state::AppState;

/// Always `200`; a down queue broker reports `degraded` rather than failing
/// the check.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let queue = state.queue.snapshot();
    let status = if queue.ready { "ok" } else { "degraded" };
    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "queue_ready": queue.ready,
            "queue": queue,
        })),
    )
}
