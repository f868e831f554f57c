use crate::{Result, ResticError};
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

use super::actor::DuckDbActor;
use super::messages::DbMessage;
use super::models::{JobLogRow, JobRunRow, LocationRow, RestoredPathRow, ScheduleRow};

/// DuckDB数据库管理器
#[derive(Debug, Clone)]
pub struct DuckDbManager {
    sender: mpsc::Sender<DbMessage>,
}

impl DuckDbManager {
    /// 创建新的DuckDB管理器
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        // 确保数据库文件的父目录存在
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (sender, receiver) = mpsc::channel(100);

        // 启动DuckDB Actor
        let actor = DuckDbActor::new(db_path)?;
        tokio::spawn(actor.run(receiver));

        let manager = Self { sender };

        // 初始化数据库表
        manager.init_tables().await?;

        Ok(manager)
    }

    /// 创建内存数据库管理器
    pub async fn new_memory() -> Result<Self> {
        let (sender, receiver) = mpsc::channel(100);

        // 启动DuckDB Actor（内存模式）
        let actor = DuckDbActor::new_memory()?;
        tokio::spawn(actor.run(receiver));

        let manager = Self { sender };

        // 初始化数据库表
        manager.init_tables().await?;

        Ok(manager)
    }

    /// 向Actor发送一条消息并等待响应
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> DbMessage,
    ) -> Result<T> {
        let (respond_to, receiver) = oneshot::channel();

        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| ResticError::custom("数据库Actor已关闭"))?;

        receiver
            .await
            .map_err(|_| ResticError::custom("数据库Actor未响应"))?
    }

    /// 初始化数据库表
    async fn init_tables(&self) -> Result<()> {
        self.request(|respond_to| DbMessage::InitTables { respond_to })
            .await
    }

    pub async fn insert_location(&self, row: LocationRow) -> Result<()> {
        self.request(|respond_to| DbMessage::InsertLocation { row, respond_to })
            .await
    }

    pub async fn get_location(&self, id: &str) -> Result<Option<LocationRow>> {
        let id = id.to_string();
        self.request(|respond_to| DbMessage::GetLocation { id, respond_to })
            .await
    }

    pub async fn list_locations(&self) -> Result<Vec<LocationRow>> {
        self.request(|respond_to| DbMessage::ListLocations { respond_to })
            .await
    }

    pub async fn update_location_paths(&self, id: &str, known_paths: String) -> Result<()> {
        let id = id.to_string();
        self.request(|respond_to| DbMessage::UpdateLocationPaths {
            id,
            known_paths,
            respond_to,
        })
        .await
    }

    pub async fn insert_schedule(&self, row: ScheduleRow) -> Result<()> {
        self.request(|respond_to| DbMessage::InsertSchedule { row, respond_to })
            .await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRow>> {
        let id = id.to_string();
        self.request(|respond_to| DbMessage::GetSchedule { id, respond_to })
            .await
    }

    pub async fn list_schedules(&self, location_id: Option<&str>) -> Result<Vec<ScheduleRow>> {
        let location_id = location_id.map(str::to_string);
        self.request(|respond_to| DbMessage::ListSchedules {
            location_id,
            respond_to,
        })
        .await
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|respond_to| DbMessage::DeleteSchedule { id, respond_to })
            .await
    }

    pub async fn update_schedule_last_run(
        &self,
        id: &str,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let id = id.to_string();
        self.request(|respond_to| DbMessage::UpdateScheduleLastRun {
            id,
            last_run_at,
            respond_to,
        })
        .await
    }

    pub async fn insert_job_log(&self, row: JobLogRow) -> Result<()> {
        self.request(|respond_to| DbMessage::InsertJobLog { row, respond_to })
            .await
    }

    pub async fn get_job_log(&self, log_id: &str) -> Result<Option<JobLogRow>> {
        let log_id = log_id.to_string();
        self.request(|respond_to| DbMessage::GetJobLog { log_id, respond_to })
            .await
    }

    pub async fn insert_job_run(&self, row: JobRunRow) -> Result<()> {
        self.request(|respond_to| DbMessage::InsertJobRun { row, respond_to })
            .await
    }

    pub async fn finish_job_run(
        &self,
        job_id: &str,
        state: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        let state = state.to_string();
        self.request(|respond_to| DbMessage::FinishJobRun {
            job_id,
            state,
            finished_at,
            respond_to,
        })
        .await
    }

    pub async fn get_job_runs_by_state(&self, state: &str) -> Result<Vec<JobRunRow>> {
        let state = state.to_string();
        self.request(|respond_to| DbMessage::GetJobRunsByState { state, respond_to })
            .await
    }

    pub async fn insert_restored_path(&self, row: RestoredPathRow) -> Result<bool> {
        self.request(|respond_to| DbMessage::InsertRestoredPath { row, respond_to })
            .await
    }

    pub async fn list_restored_paths(&self) -> Result<Vec<RestoredPathRow>> {
        self.request(|respond_to| DbMessage::ListRestoredPaths { respond_to })
            .await
    }
}
