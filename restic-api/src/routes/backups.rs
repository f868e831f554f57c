use super::AppState;
use super::sse::event_stream;
use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use restic_core::constants::restic::DEFAULT_STDIN_FILENAME;
use restic_core::restic::{BackupSource, RestoreOptions, SnapshotInfo};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct ListBackupsQuery {
    pub path: Option<String>,
}

/// GET /locations/{location_id}/backups
pub async fn list_backups(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Query(query): Query<ListBackupsQuery>,
) -> ApiResult<Json<Vec<SnapshotInfo>>> {
    let snapshots = state
        .engine
        .list_snapshots(&location_id, query.path.as_deref())
        .await?;
    Ok(Json(snapshots))
}

/// 备份请求：`{"path": ...}` 或 `{"type": "command", "command": ..., "filename": ...}`
#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub filename: Option<String>,
}

impl BackupRequest {
    fn into_source(self) -> ApiResult<BackupSource> {
        match self.kind.as_deref().unwrap_or("directory") {
            "directory" => self
                .path
                .map(BackupSource::directory)
                .ok_or_else(|| ApiError::bad_request("缺少 path 参数")),
            "command" => {
                let command = self
                    .command
                    .ok_or_else(|| ApiError::bad_request("缺少 command 参数"))?;
                let filename = self
                    .filename
                    .unwrap_or_else(|| DEFAULT_STDIN_FILENAME.to_string());
                Ok(BackupSource::command(command, filename))
            }
            other => Err(ApiError::bad_request(format!(
                "type 只能是 directory 或 command，收到: {other}"
            ))),
        }
    }
}

/// POST /locations/{location_id}/backups，返回 SSE 事件流
pub async fn create_backup(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Json(request): Json<BackupRequest>,
) -> ApiResult<Response> {
    let source = request.into_source()?;
    let receiver = state.engine.run_backup(&location_id, source).await?;
    Ok(event_stream(receiver).into_response())
}

#[derive(Debug, Deserialize)]
pub struct BackupContentsQuery {
    pub directory_path: Option<String>,
    pub recursive: Option<String>,
    pub is_logs: Option<String>,
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

/// GET /locations/{location_id}/backups/{snapshot_id}
///
/// `is_logs=1` 时返回该快照的备份日志，否则列出快照内容。
pub async fn list_backup_contents(
    State(state): State<AppState>,
    Path((location_id, snapshot_id)): Path<(String, String)>,
    Query(query): Query<BackupContentsQuery>,
) -> ApiResult<Response> {
    if is_truthy(query.is_logs.as_deref()) {
        state.engine.registry().get(&location_id).await?;
        let log = state.engine.get_log(&snapshot_id).await?;
        return Ok(Json(json!({
            "logs": log.output,
            "success": log.success,
            "reason": log.reason,
        }))
        .into_response());
    }

    let entries = state
        .engine
        .browse_snapshot(
            &location_id,
            &snapshot_id,
            query.directory_path.as_deref().unwrap_or("/"),
            is_truthy(query.recursive.as_deref()),
        )
        .await?;
    Ok(Json(entries).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub target: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// 兼容 0/1 与 true/false
    #[serde(default)]
    pub is_dry_run: Option<Value>,
}

fn value_is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => is_truthy(Some(s.as_str())),
        _ => false,
    }
}

/// POST /locations/{location_id}/backups/{snapshot_id}/restore，返回 SSE 事件流
pub async fn restore_backup(
    State(state): State<AppState>,
    Path((location_id, snapshot_id)): Path<(String, String)>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Response> {
    let options = RestoreOptions {
        snapshot_id,
        dry_run: value_is_truthy(request.is_dry_run.as_ref()),
        target: request.target,
        include: request.include,
        exclude: request.exclude,
    };
    let receiver = state.engine.run_restore(&location_id, options).await?;
    Ok(event_stream(receiver).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_request_to_source() {
        let request: BackupRequest = serde_json::from_value(json!({"path": "/data"})).unwrap();
        assert_eq!(
            request.into_source().unwrap(),
            BackupSource::directory("/data")
        );

        let request: BackupRequest = serde_json::from_value(json!({
            "type": "command",
            "command": "pg_dumpall",
            "filename": "all.sql"
        }))
        .unwrap();
        assert_eq!(
            request.into_source().unwrap(),
            BackupSource::command("pg_dumpall", "all.sql")
        );

        let request: BackupRequest = serde_json::from_value(json!({"type": "ftp"})).unwrap();
        assert!(request.into_source().is_err());
        let request: BackupRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.into_source().is_err());
    }

    #[test]
    fn test_flags() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("True")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(None));
        assert!(value_is_truthy(Some(&json!(1))));
        assert!(value_is_truthy(Some(&json!(true))));
        assert!(!value_is_truthy(Some(&json!(0))));
        assert!(!value_is_truthy(None));
    }
}
