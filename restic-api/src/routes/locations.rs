use super::AppState;
use crate::error::ApiResult;
use axum::Json;
use axum::extract::State;
use restic_core::database::Location;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct InitLocationRequest {
    /// 仓库路径
    pub location: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct InitLocationResponse {
    pub message: String,
    pub location_id: String,
    pub location: String,
}

/// POST /locations
pub async fn init_location(
    State(state): State<AppState>,
    Json(request): Json<InitLocationRequest>,
) -> ApiResult<Json<InitLocationResponse>> {
    let location = state
        .engine
        .initialize_repository(&request.location, &request.password)
        .await?;

    Ok(Json(InitLocationResponse {
        message: "仓库初始化成功".to_string(),
        location_id: location.id,
        location: location.repository_path,
    }))
}

/// GET /locations
pub async fn list_locations(State(state): State<AppState>) -> Json<Vec<Location>> {
    Json(state.engine.list_locations().await)
}
