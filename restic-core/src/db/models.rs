use chrono::{DateTime, Utc};

/// 存储位置记录（数据库原始行）
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRow {
    pub id: String,
    pub repository_path: String,
    pub credential: String,
    /// JSON 数组
    pub known_paths: String,
    pub created_at: DateTime<Utc>,
}

/// 定时任务记录
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRow {
    pub id: String,
    pub location_id: String,
    pub kind: String,
    pub path_or_command: String,
    pub stdin_filename: Option<String>,
    pub frequency: String,
    pub time_of_day: String,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// 任务日志记录
#[derive(Debug, Clone, PartialEq)]
pub struct JobLogRow {
    pub log_id: String,
    pub job_id: String,
    pub location_id: String,
    pub operation: String,
    pub success: bool,
    pub reason: Option<String>,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

/// 任务运行记录，仅用于重启后恢复
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunRow {
    pub job_id: String,
    pub location_id: String,
    pub operation: String,
    pub target_path: String,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 已恢复目录记录
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredPathRow {
    pub path: String,
    pub location_id: String,
    pub snapshot_id: String,
    pub restored_at: DateTime<Utc>,
}
