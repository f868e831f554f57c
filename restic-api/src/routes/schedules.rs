use super::AppState;
use super::sse::event_stream;
use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use restic_core::database::{Frequency, Schedule, ScheduleKind, parse_time_of_day_input};
use restic_core::scheduler::NewSchedule;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// 定时任务请求：目录备份需要 path，命令备份需要 command（filename 可选）
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub filename: Option<String>,
    pub frequency: String,
    pub time: String,
}

impl CreateScheduleRequest {
    fn into_new_schedule(self) -> ApiResult<NewSchedule> {
        let kind: ScheduleKind = self.kind.as_deref().unwrap_or("directory").parse()?;
        let frequency: Frequency = self.frequency.parse()?;
        let time_of_day = parse_time_of_day_input(&self.time)?;

        let (path_or_command, stdin_filename) = match kind {
            ScheduleKind::Directory => (
                self.path
                    .ok_or_else(|| ApiError::bad_request("目录备份需要 path 参数"))?,
                None,
            ),
            ScheduleKind::Command => (
                self.command
                    .ok_or_else(|| ApiError::bad_request("命令备份需要 command 参数"))?,
                self.filename,
            ),
        };

        Ok(NewSchedule {
            kind,
            path_or_command,
            stdin_filename,
            frequency,
            time_of_day,
        })
    }
}

/// POST /locations/{location_id}/schedule
pub async fn create_schedule(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<Json<Schedule>> {
    let new_schedule = request.into_new_schedule()?;
    let schedule = state.scheduler.create(&location_id, new_schedule).await?;
    Ok(Json(schedule))
}

#[derive(Debug, Serialize)]
pub struct ScheduleList {
    pub schedules: Vec<Schedule>,
}

/// GET /locations/{location_id}/schedule
pub async fn list_schedules(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
) -> ApiResult<Json<ScheduleList>> {
    let schedules = state.scheduler.list(&location_id).await?;
    Ok(Json(ScheduleList { schedules }))
}

/// DELETE /locations/{location_id}/schedule/{schedule_id}
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path((location_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.scheduler.delete(&location_id, &schedule_id).await?;
    Ok(Json(json!({ "message": "定时任务已删除" })))
}

/// POST /locations/{location_id}/schedule/{schedule_id}/execute-backup，返回 SSE 事件流
pub async fn execute_backup(
    State(state): State<AppState>,
    Path((location_id, schedule_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let receiver = state
        .scheduler
        .execute_now(&location_id, &schedule_id)
        .await?;
    Ok(event_stream(receiver).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn request(value: Value) -> CreateScheduleRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_directory_request() {
        let schedule = request(json!({"path": "/data", "frequency": "weekly", "time": "02:15"}))
            .into_new_schedule()
            .unwrap();
        assert_eq!(schedule.kind, ScheduleKind::Directory);
        assert_eq!(schedule.frequency, Frequency::Weekly);
        assert_eq!(schedule.time_of_day, NaiveTime::from_hms_opt(2, 15, 0).unwrap());
        assert!(schedule.stdin_filename.is_none());
    }

    #[test]
    fn test_command_request() {
        let schedule = request(json!({
            "type": "command",
            "command": "mysqldump app",
            "filename": "app.sql",
            "frequency": "daily",
            "time": "23:00"
        }))
        .into_new_schedule()
        .unwrap();
        assert_eq!(schedule.kind, ScheduleKind::Command);
        assert_eq!(schedule.path_or_command, "mysqldump app");
        assert_eq!(schedule.stdin_filename.as_deref(), Some("app.sql"));
    }

    #[test]
    fn test_invalid_requests() {
        for value in [
            json!({"path": "/data", "frequency": "hourly", "time": "02:15"}),
            json!({"path": "/data", "frequency": "daily", "time": "2:75"}),
            json!({"type": "command", "frequency": "daily", "time": "02:15"}),
            json!({"type": "ftp", "path": "/data", "frequency": "daily", "time": "02:15"}),
        ] {
            assert!(request(value.clone()).into_new_schedule().is_err(), "{value}");
        }
    }
}
