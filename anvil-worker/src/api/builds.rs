//! Build submission and lookup handlers

use anvil_core::domain::{BuildSummary, BuildTask, StageResult};
use anvil_core::trigger;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::scheduler::QueueError;

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub build_id: String,
}

/// POST /builds
/// Queue a build for execution
pub async fn submit_build(
    State(state): State<AppState>,
    Json(task): Json<BuildTask>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    tracing::info!("Received build {} for {}", task.build_id, task.repo);

    if task.build_id.trim().is_empty() {
        return Err(ApiError::BadRequest("build_id must not be empty".to_string()));
    }
    if state.valet.is_active(&task.build_id) {
        return Err(ApiError::Conflict(format!(
            "build {} is already running on this node",
            task.build_id
        )));
    }

    // Reject malformed trigger expressions before the build is queued
    for stage in &task.definition.stages {
        if let Some(condition) = stage.trigger.as_ref().and_then(|t| t.condition.as_deref()) {
            trigger::parse(condition).map_err(|e| {
                ApiError::BadRequest(format!("stage {} has an invalid trigger: {}", stage.name, e))
            })?;
        }
    }

    let build_id = task.build_id.clone();
    state.queue.submit(task).map_err(|e| match e {
        QueueError::Full => ApiError::Unavailable(e.to_string()),
        QueueError::Closed => ApiError::Unavailable("worker is shutting down".to_string()),
        QueueError::Duplicate(_) => ApiError::Conflict(e.to_string()),
    })?;

    Ok((StatusCode::ACCEPTED, Json(Accepted { build_id })))
}

/// GET /builds
/// List builds running on this node
pub async fn list_builds(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.valet.active_builds())
}

/// GET /builds/{id}/summary
pub async fn get_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BuildSummary>> {
    let summary = state.results.retrieve_summary(&id).await?;
    Ok(Json(summary))
}

/// GET /builds/{id}/stages
pub async fn get_stages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StageResult>>> {
    let stages = state.results.retrieve_stage_detail(&id).await?;
    Ok(Json(stages))
}
