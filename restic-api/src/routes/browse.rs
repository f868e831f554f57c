use super::AppState;
use crate::error::ApiResult;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use restic_core::database::RestoredPath;
use restic_core::restored::LocalEntry;

/// 通配段不带开头的 `/`，这里补回绝对路径
fn absolute(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// GET /browse，列出已恢复的目录
pub async fn list_restored(State(state): State<AppState>) -> ApiResult<Json<Vec<RestoredPath>>> {
    Ok(Json(state.browser.list_roots().await?))
}

/// GET /browse/{*path}
pub async fn browse_dir(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Json<Vec<LocalEntry>>> {
    Ok(Json(state.browser.list_dir(&absolute(&path)).await?))
}

/// GET /view/{*path}，文本文件按 text/plain 返回，其余按二进制返回
pub async fn view_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> ApiResult<Response> {
    let bytes = state.browser.read_file(&absolute(&path)).await?;
    let response = match String::from_utf8(bytes) {
        Ok(text) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response(),
        Err(e) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            e.into_bytes(),
        )
            .into_response(),
    };
    Ok(response)
}
