use crate::Result;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::models::{JobLogRow, JobRunRow, LocationRow, RestoredPathRow, ScheduleRow};

/// DuckDB数据库操作消息
#[derive(Debug)]
pub enum DbMessage {
    /// 初始化数据库表
    InitTables {
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 存储位置 ==========
    /// 新增存储位置
    InsertLocation {
        row: LocationRow,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取存储位置
    GetLocation {
        id: String,
        respond_to: oneshot::Sender<Result<Option<LocationRow>>>,
    },
    /// 获取全部存储位置
    ListLocations {
        respond_to: oneshot::Sender<Result<Vec<LocationRow>>>,
    },
    /// 更新已知备份路径
    UpdateLocationPaths {
        id: String,
        known_paths: String,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 定时任务 ==========
    /// 新增定时任务
    InsertSchedule {
        row: ScheduleRow,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 根据ID获取定时任务
    GetSchedule {
        id: String,
        respond_to: oneshot::Sender<Result<Option<ScheduleRow>>>,
    },
    /// 获取定时任务（可按存储位置过滤）
    ListSchedules {
        location_id: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<ScheduleRow>>>,
    },
    /// 删除定时任务，返回是否删除了记录
    DeleteSchedule {
        id: String,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// 更新上次执行时间（None 表示清空）
    UpdateScheduleLastRun {
        id: String,
        last_run_at: Option<DateTime<Utc>>,
        respond_to: oneshot::Sender<Result<()>>,
    },

    // ========== 任务日志 ==========
    /// 写入任务日志（只写一次）
    InsertJobLog {
        row: JobLogRow,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 获取任务日志
    GetJobLog {
        log_id: String,
        respond_to: oneshot::Sender<Result<Option<JobLogRow>>>,
    },

    // ========== 任务运行记录 ==========
    /// 记录任务开始运行
    InsertJobRun {
        row: JobRunRow,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 记录任务结束
    FinishJobRun {
        job_id: String,
        state: String,
        finished_at: DateTime<Utc>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// 获取指定状态的任务运行记录
    GetJobRunsByState {
        state: String,
        respond_to: oneshot::Sender<Result<Vec<JobRunRow>>>,
    },

    // ========== 已恢复目录 ==========
    /// 记录已恢复目录，返回是否为新记录
    InsertRestoredPath {
        row: RestoredPathRow,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// 获取全部已恢复目录
    ListRestoredPaths {
        respond_to: oneshot::Sender<Result<Vec<RestoredPathRow>>>,
    },
}
