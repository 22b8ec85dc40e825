use std::collections::BTreeMap;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::jobs::{self, CleanupKind, CleanupPayload};
use crate::queue::{JobHandle, QueueCounts, QueueName};
use crate::state::AppState;

#[derive(Serialize)]
pub struct QueueStatsResponse {
    pub ready: bool,
    pub queues: BTreeMap<QueueName, QueueCounts>,
}

#[derive(Serialize)]
pub struct QueueStateResponse {
    pub queue: QueueName,
    pub paused: bool,
}

#[derive(Deserialize)]
pub struct CleanupRequest {
    #[serde(rename = "type")]
    pub kind: CleanupKind,
    #[serde(default)]
    pub dry_run: bool,
    pub older_than_hours: Option<u64>,
    pub keep_completed: Option<u64>,
}

fn parse_queue(name: &str) -> AppResult<QueueName> {
    name.parse::<QueueName>().map_err(AppError::from)
}

pub async fn queue_stats(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<QueueStatsResponse>> {
    let queues = jobs::get_queue_stats(&state.queue).await?;
    Ok(Json(QueueStatsResponse {
        ready: state.queue.is_ready(),
        queues,
    }))
}

pub async fn pause_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    user: AuthenticatedUser,
) -> AppResult<Json<QueueStateResponse>> {
    user.require_admin()?;
    let queue = parse_queue(&name)?;
    jobs::pause_queue(&state.queue, queue).await?;
    info!(queue = %queue, user_id = %user.user_id, "queue paused by operator");
    Ok(Json(QueueStateResponse {
        queue,
        paused: true,
    }))
}

pub async fn resume_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    user: AuthenticatedUser,
) -> AppResult<Json<QueueStateResponse>> {
    user.require_admin()?;
    let queue = parse_queue(&name)?;
    jobs::resume_queue(&state.queue, queue).await?;
    info!(queue = %queue, user_id = %user.user_id, "queue resumed by operator");
    Ok(Json(QueueStateResponse {
        queue,
        paused: false,
    }))
}

/// Row-level cleanups run against the caller's tenant only; temp files and
/// job history are shared and have no tenant.
fn cleanup_tenant(kind: CleanupKind, tenant_id: Uuid) -> Option<Uuid> {
    match kind {
        CleanupKind::TempFiles | CleanupKind::CompletedJobs => None,
        CleanupKind::OldDocuments | CleanupKind::AuditLogs | CleanupKind::StaleDocuments => {
            Some(tenant_id)
        }
    }
}

pub async fn schedule_cleanup(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CleanupRequest>,
) -> AppResult<(StatusCode, Json<JobHandle>)> {
    user.require_admin()?;
    if request.older_than_hours == Some(0) {
        return Err(AppError::bad_request("older_than_hours must be greater than zero"));
    }

    let payload = CleanupPayload {
        kind: request.kind,
        dry_run: request.dry_run,
        older_than_hours: request.older_than_hours,
        tenant_id: cleanup_tenant(request.kind, user.tenant_id),
        keep_completed: request.keep_completed,
    };
    let handle = jobs::schedule_cleanup(&state.queue, &payload).await?;
    info!(
        kind = ?payload.kind,
        dry_run = payload.dry_run,
        job_id = %handle.job_id,
        "cleanup scheduled"
    );
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_cleanups_ignore_the_tenant() {
        let tenant = Uuid::new_v4();
        assert_eq!(cleanup_tenant(CleanupKind::TempFiles, tenant), None);
        assert_eq!(cleanup_tenant(CleanupKind::AuditLogs, tenant), Some(tenant));
        assert!(parse_queue("crm-upload").is_ok());
        assert_eq!(
            parse_queue("emails").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
