use crate::db::{DuckDbManager, JobLogRow, JobRunRow, LocationRow, RestoredPathRow, ScheduleRow};
use crate::{Result, ResticError};
use chrono::{DateTime, NaiveTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// 数据库管理器 - DuckDB适配器
#[derive(Debug, Clone)]
pub struct Database {
    manager: DuckDbManager,
}

/// 仓库密码，Debug 输出时隐藏内容
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// 取出明文，只应在构造子进程环境变量时调用
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// 存储位置（restic 仓库）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Location {
    pub id: String,
    pub repository_path: String,
    #[serde(skip_serializing)]
    pub credential: Credential,
    pub known_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// 任务操作类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Backup,
    Restore,
}

/// 任务状态：Pending -> Running -> {Succeeded, Failed}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// 任务日志，任务结束时写入一次，之后不再修改
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobLog {
    pub log_id: String,
    pub job_id: String,
    pub location_id: String,
    pub operation: Operation,
    pub success: bool,
    pub reason: Option<String>,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

/// 任务运行记录
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub job_id: String,
    pub location_id: String,
    pub operation: Operation,
    pub target_path: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 定时备份类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Directory,
    Command,
}

/// 定时备份频率
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// 每天
    Daily,
    /// 每周日
    Weekly,
    /// 每月1日
    Monthly,
}

/// 定时备份任务
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Schedule {
    pub schedule_id: String,
    pub location_id: String,
    pub kind: ScheduleKind,
    pub path_or_command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_filename: Option<String>,
    pub frequency: Frequency,
    #[serde(serialize_with = "serialize_time_of_day")]
    pub time_of_day: NaiveTime,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// 恢复成功的目标目录
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestoredPath {
    pub path: String,
    pub location_id: String,
    pub snapshot_id: String,
    pub restored_at: DateTime<Utc>,
}

fn serialize_time_of_day<S: serde::Serializer>(
    time: &NaiveTime,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format(crate::constants::scheduler::TIME_OF_DAY_FORMAT))
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = ResticError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ResticError::invalid_input(format!(
                        "无效的{}: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(Operation { Backup => "backup", Restore => "restore" });
string_enum!(JobState {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});
string_enum!(ScheduleKind { Directory => "directory", Command => "command" });
string_enum!(Frequency { Daily => "daily", Weekly => "weekly", Monthly => "monthly" });

/// DuckDB TIMESTAMP 精度为微秒，写入前截断，保证读回的值与写入的一致
fn stored(time: &DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(6)
}

fn parse_time_of_day(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text, crate::constants::scheduler::TIME_OF_DAY_FORMAT)
        .map_err(|e| ResticError::invalid_input(format!("无效的时间 {text}，应为 HH:MM: {e}")))
}

impl Database {
    /// 连接到数据库
    pub async fn connect<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let manager = DuckDbManager::new(db_path).await?;
        Ok(Database { manager })
    }

    /// 连接到内存数据库 (主要用于测试，生产环境建议使用connect()以确保数据持久化)
    pub async fn connect_memory() -> Result<Self> {
        let manager = DuckDbManager::new_memory().await?;
        Ok(Database { manager })
    }

    // ========================================
    // 存储位置
    // ========================================

    pub async fn insert_location(&self, location: &Location) -> Result<()> {
        self.manager
            .insert_location(LocationRow {
                id: location.id.clone(),
                repository_path: location.repository_path.clone(),
                credential: location.credential.expose().to_string(),
                known_paths: serde_json::to_string(&location.known_paths)?,
                created_at: stored(&location.created_at),
            })
            .await
    }

    pub async fn get_location(&self, id: &str) -> Result<Option<Location>> {
        self.manager
            .get_location(id)
            .await?
            .map(location_from_row)
            .transpose()
    }

    pub async fn list_locations(&self) -> Result<Vec<Location>> {
        self.manager
            .list_locations()
            .await?
            .into_iter()
            .map(location_from_row)
            .collect()
    }

    pub async fn update_known_paths(&self, id: &str, known_paths: &[String]) -> Result<()> {
        self.manager
            .update_location_paths(id, serde_json::to_string(known_paths)?)
            .await
    }

    // ========================================
    // 定时任务
    // ========================================

    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.manager
            .insert_schedule(ScheduleRow {
                id: schedule.schedule_id.clone(),
                location_id: schedule.location_id.clone(),
                kind: schedule.kind.as_str().to_string(),
                path_or_command: schedule.path_or_command.clone(),
                stdin_filename: schedule.stdin_filename.clone(),
                frequency: schedule.frequency.as_str().to_string(),
                time_of_day: schedule
                    .time_of_day
                    .format(crate::constants::scheduler::TIME_OF_DAY_FORMAT)
                    .to_string(),
                created_at: stored(&schedule.created_at),
                last_run_at: schedule.last_run_at.as_ref().map(stored),
            })
            .await
    }

    /// 直接写入原始行，用于构造无法通过正常接口产生的记录
    #[cfg(test)]
    pub(crate) async fn insert_schedule_row(&self, row: ScheduleRow) -> Result<()> {
        self.manager.insert_schedule(row).await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        self.manager
            .get_schedule(id)
            .await?
            .map(schedule_from_row)
            .transpose()
    }

    /// 获取定时任务，按创建时间排序
    ///
    /// 无法解析的记录会被跳过并记录警告，不影响其余定时任务。
    pub async fn list_schedules(&self, location_id: Option<&str>) -> Result<Vec<Schedule>> {
        let rows = self.manager.list_schedules(location_id).await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in rows {
            let schedule_id = row.id.clone();
            match schedule_from_row(row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => warn!(schedule_id = %schedule_id, error = %e, "跳过无法解析的定时任务"),
            }
        }
        Ok(schedules)
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        self.manager.delete_schedule(id).await
    }

    /// 更新上次执行时间，传入 None 时清空
    pub async fn update_schedule_last_run(
        &self,
        id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.manager
            .update_schedule_last_run(id, at.as_ref().map(stored))
            .await
    }

    // ========================================
    // 任务日志
    // ========================================

    pub async fn insert_job_log(&self, log: &JobLog) -> Result<()> {
        self.manager
            .insert_job_log(JobLogRow {
                log_id: log.log_id.clone(),
                job_id: log.job_id.clone(),
                location_id: log.location_id.clone(),
                operation: log.operation.as_str().to_string(),
                success: log.success,
                reason: log.reason.clone(),
                output: log.output.clone(),
                created_at: stored(&log.created_at),
            })
            .await
    }

    pub async fn get_job_log(&self, log_id: &str) -> Result<Option<JobLog>> {
        let Some(row) = self.manager.get_job_log(log_id).await? else {
            return Ok(None);
        };

        Ok(Some(JobLog {
            log_id: row.log_id,
            job_id: row.job_id,
            location_id: row.location_id,
            operation: row.operation.parse()?,
            success: row.success,
            reason: row.reason,
            output: row.output,
            created_at: row.created_at,
        }))
    }

    // ========================================
    // 任务运行记录
    // ========================================

    pub async fn insert_job_run(&self, run: &JobRun) -> Result<()> {
        self.manager
            .insert_job_run(JobRunRow {
                job_id: run.job_id.clone(),
                location_id: run.location_id.clone(),
                operation: run.operation.as_str().to_string(),
                target_path: run.target_path.clone(),
                state: run.state.as_str().to_string(),
                started_at: stored(&run.started_at),
                finished_at: run.finished_at.as_ref().map(stored),
            })
            .await
    }

    pub async fn finish_job_run(
        &self,
        job_id: &str,
        state: JobState,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        self.manager
            .finish_job_run(job_id, state.as_str(), stored(&finished_at))
            .await
    }

    pub async fn get_job_runs_by_state(&self, state: JobState) -> Result<Vec<JobRun>> {
        let rows = self.manager.get_job_runs_by_state(state.as_str()).await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            runs.push(JobRun {
                job_id: row.job_id,
                location_id: row.location_id,
                operation: row.operation.parse()?,
                target_path: row.target_path,
                state: row.state.parse()?,
                started_at: row.started_at,
                finished_at: row.finished_at,
            });
        }
        Ok(runs)
    }

    // ========================================
    // 已恢复目录
    // ========================================

    /// 记录恢复目标目录，已存在时保持原记录，返回是否为新记录
    pub async fn record_restored_path(&self, restored: &RestoredPath) -> Result<bool> {
        self.manager
            .insert_restored_path(RestoredPathRow {
                path: restored.path.clone(),
                location_id: restored.location_id.clone(),
                snapshot_id: restored.snapshot_id.clone(),
                restored_at: stored(&restored.restored_at),
            })
            .await
    }

    pub async fn list_restored_paths(&self) -> Result<Vec<RestoredPath>> {
        Ok(self
            .manager
            .list_restored_paths()
            .await?
            .into_iter()
            .map(|row| RestoredPath {
                path: row.path,
                location_id: row.location_id,
                snapshot_id: row.snapshot_id,
                restored_at: row.restored_at,
            })
            .collect())
    }
}

fn location_from_row(row: LocationRow) -> Result<Location> {
    Ok(Location {
        id: row.id,
        repository_path: row.repository_path,
        credential: Credential::new(row.credential),
        known_paths: serde_json::from_str(&row.known_paths)?,
        created_at: row.created_at,
    })
}

fn schedule_from_row(row: ScheduleRow) -> Result<Schedule> {
    Ok(Schedule {
        schedule_id: row.id,
        location_id: row.location_id,
        kind: row.kind.parse()?,
        path_or_command: row.path_or_command,
        stdin_filename: row.stdin_filename,
        frequency: row.frequency.parse()?,
        time_of_day: parse_time_of_day(&row.time_of_day)?,
        created_at: row.created_at,
        last_run_at: row.last_run_at,
    })
}

/// 解析 HH:MM 格式的时间
pub fn parse_time_of_day_input(text: &str) -> Result<NaiveTime> {
    parse_time_of_day(text.trim())
}
