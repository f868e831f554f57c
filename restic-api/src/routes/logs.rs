use super::AppState;
use crate::error::ApiResult;
use axum::Json;
use axum::extract::{Path, State};
use restic_core::database::JobLog;

/// GET /logs/{log_id}，log_id 为快照ID或任务ID
pub async fn get_log(
    State(state): State<AppState>,
    Path(log_id): Path<String>,
) -> ApiResult<Json<JobLog>> {
    Ok(Json(state.engine.get_log(&log_id).await?))
}
