use crate::Result;
use chrono::{DateTime, Utc};
use duckdb::{Connection, Row, params};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::messages::DbMessage;
use super::models::{JobLogRow, JobRunRow, LocationRow, RestoredPathRow, ScheduleRow};

const LOCATION_COLUMNS: &str = "id, repository_path, credential, known_paths, created_at";
const SCHEDULE_COLUMNS: &str = "id, location_id, kind, path_or_command, stdin_filename, \
     frequency, time_of_day, created_at, last_run_at";
const JOB_LOG_COLUMNS: &str =
    "log_id, job_id, location_id, operation, success, reason, output, created_at";
const JOB_RUN_COLUMNS: &str =
    "job_id, location_id, operation, target_path, state, started_at, finished_at";
const RESTORED_PATH_COLUMNS: &str = "path, location_id, snapshot_id, restored_at";

/// DuckDB Actor - 确保单线程访问DuckDB
pub struct DuckDbActor {
    connection: Connection,
}

impl DuckDbActor {
    /// 创建新的DuckDB Actor
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let connection = Connection::open(db_path)?;
        Ok(Self { connection })
    }

    /// 创建内存DuckDB Actor
    pub fn new_memory() -> Result<Self> {
        let connection = Connection::open_in_memory()?;
        Ok(Self { connection })
    }

    /// 运行Actor消息循环
    pub async fn run(mut self, mut receiver: mpsc::Receiver<DbMessage>) {
        info!("DuckDB Actor 已启动");

        while let Some(message) = receiver.recv().await {
            self.handle_message(message);
        }

        info!("DuckDB Actor 已关闭");
    }

    /// 处理数据库消息
    fn handle_message(&mut self, message: DbMessage) {
        match message {
            DbMessage::InitTables { respond_to } => {
                let _ = respond_to.send(self.init_tables());
            }
            DbMessage::InsertLocation { row, respond_to } => {
                let _ = respond_to.send(self.insert_location(&row));
            }
            DbMessage::GetLocation { id, respond_to } => {
                let _ = respond_to.send(self.get_location(&id));
            }
            DbMessage::ListLocations { respond_to } => {
                let _ = respond_to.send(self.list_locations());
            }
            DbMessage::UpdateLocationPaths {
                id,
                known_paths,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_location_paths(&id, &known_paths));
            }
            DbMessage::InsertSchedule { row, respond_to } => {
                let _ = respond_to.send(self.insert_schedule(&row));
            }
            DbMessage::GetSchedule { id, respond_to } => {
                let _ = respond_to.send(self.get_schedule(&id));
            }
            DbMessage::ListSchedules {
                location_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_schedules(location_id.as_deref()));
            }
            DbMessage::DeleteSchedule { id, respond_to } => {
                let _ = respond_to.send(self.delete_schedule(&id));
            }
            DbMessage::UpdateScheduleLastRun {
                id,
                last_run_at,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_schedule_last_run(&id, last_run_at));
            }
            DbMessage::InsertJobLog { row, respond_to } => {
                let _ = respond_to.send(self.insert_job_log(&row));
            }
            DbMessage::GetJobLog { log_id, respond_to } => {
                let _ = respond_to.send(self.get_job_log(&log_id));
            }
            DbMessage::InsertJobRun { row, respond_to } => {
                let _ = respond_to.send(self.insert_job_run(&row));
            }
            DbMessage::FinishJobRun {
                job_id,
                state,
                finished_at,
                respond_to,
            } => {
                let _ = respond_to.send(self.finish_job_run(&job_id, &state, finished_at));
            }
            DbMessage::GetJobRunsByState { state, respond_to } => {
                let _ = respond_to.send(self.get_job_runs_by_state(&state));
            }
            DbMessage::InsertRestoredPath { row, respond_to } => {
                let _ = respond_to.send(self.insert_restored_path(&row));
            }
            DbMessage::ListRestoredPaths { respond_to } => {
                let _ = respond_to.send(self.list_restored_paths());
            }
        }
    }

    /// 初始化数据库表
    fn init_tables(&mut self) -> Result<()> {
        debug!("正在初始化DuckDB表...");

        let sql_content = include_str!("../../migrations/init_duckdb.sql");

        // 按分号分割SQL语句并执行
        for statement in sql_content.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                self.connection.execute(trimmed, [])?;
            }
        }

        info!("DuckDB表初始化完成");
        Ok(())
    }

    // ========== 存储位置 ==========

    fn insert_location(&mut self, row: &LocationRow) -> Result<()> {
        self.connection.execute(
            &format!("INSERT INTO locations ({LOCATION_COLUMNS}) VALUES (?, ?, ?, ?, ?)"),
            params![
                row.id,
                row.repository_path,
                row.credential,
                row.known_paths,
                row.created_at
            ],
        )?;
        Ok(())
    }

    fn get_location(&mut self, id: &str) -> Result<Option<LocationRow>> {
        let mut stmt = self
            .connection
            .prepare(&format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?"))?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(location_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_locations(&mut self) -> Result<Vec<LocationRow>> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations ORDER BY created_at, id"
        ))?;
        let iter = stmt.query_map([], location_from_row)?;

        let mut locations = Vec::new();
        for location in iter {
            locations.push(location?);
        }
        Ok(locations)
    }

    fn update_location_paths(&mut self, id: &str, known_paths: &str) -> Result<()> {
        self.connection.execute(
            "UPDATE locations SET known_paths = ? WHERE id = ?",
            params![known_paths, id],
        )?;
        Ok(())
    }

    // ========== 定时任务 ==========

    fn insert_schedule(&mut self, row: &ScheduleRow) -> Result<()> {
        self.connection.execute(
            &format!("INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                row.id,
                row.location_id,
                row.kind,
                row.path_or_command,
                row.stdin_filename,
                row.frequency,
                row.time_of_day,
                row.created_at,
                row.last_run_at
            ],
        )?;
        Ok(())
    }

    fn get_schedule(&mut self, id: &str) -> Result<Option<ScheduleRow>> {
        let mut stmt = self
            .connection
            .prepare(&format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?"))?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(schedule_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_schedules(&mut self, location_id: Option<&str>) -> Result<Vec<ScheduleRow>> {
        let mut schedules = Vec::new();

        match location_id {
            Some(location_id) => {
                let mut stmt = self.connection.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE location_id = ? ORDER BY created_at, id"
                ))?;
                for schedule in stmt.query_map(params![location_id], schedule_from_row)? {
                    schedules.push(schedule?);
                }
            }
            None => {
                let mut stmt = self.connection.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at, id"
                ))?;
                for schedule in stmt.query_map([], schedule_from_row)? {
                    schedules.push(schedule?);
                }
            }
        }

        Ok(schedules)
    }

    fn delete_schedule(&mut self, id: &str) -> Result<bool> {
        let deleted = self
            .connection
            .execute("DELETE FROM schedules WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }

    fn update_schedule_last_run(
        &mut self,
        id: &str,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE schedules SET last_run_at = ? WHERE id = ?",
            params![last_run_at, id],
        )?;
        Ok(())
    }

    // ========== 任务日志 ==========

    fn insert_job_log(&mut self, row: &JobLogRow) -> Result<()> {
        self.connection.execute(
            &format!("INSERT INTO job_logs ({JOB_LOG_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                row.log_id,
                row.job_id,
                row.location_id,
                row.operation,
                row.success,
                row.reason,
                row.output,
                row.created_at
            ],
        )?;
        Ok(())
    }

    fn get_job_log(&mut self, log_id: &str) -> Result<Option<JobLogRow>> {
        let mut stmt = self
            .connection
            .prepare(&format!("SELECT {JOB_LOG_COLUMNS} FROM job_logs WHERE log_id = ?"))?;
        let mut rows = stmt.query(params![log_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(JobLogRow {
                log_id: row.get(0)?,
                job_id: row.get(1)?,
                location_id: row.get(2)?,
                operation: row.get(3)?,
                success: row.get(4)?,
                reason: row.get(5)?,
                output: row.get(6)?,
                created_at: row.get(7)?,
            })),
            None => Ok(None),
        }
    }

    // ========== 任务运行记录 ==========

    fn insert_job_run(&mut self, row: &JobRunRow) -> Result<()> {
        self.connection.execute(
            &format!("INSERT INTO job_runs ({JOB_RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                row.job_id,
                row.location_id,
                row.operation,
                row.target_path,
                row.state,
                row.started_at,
                row.finished_at
            ],
        )?;
        Ok(())
    }

    fn finish_job_run(
        &mut self,
        job_id: &str,
        state: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        self.connection.execute(
            "UPDATE job_runs SET state = ?, finished_at = ? WHERE job_id = ?",
            params![state, finished_at, job_id],
        )?;
        Ok(())
    }

    fn get_job_runs_by_state(&mut self, state: &str) -> Result<Vec<JobRunRow>> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE state = ? ORDER BY started_at"
        ))?;
        let iter = stmt.query_map(params![state], |row| {
            Ok(JobRunRow {
                job_id: row.get(0)?,
                location_id: row.get(1)?,
                operation: row.get(2)?,
                target_path: row.get(3)?,
                state: row.get(4)?,
                started_at: row.get(5)?,
                finished_at: row.get(6)?,
            })
        })?;

        let mut runs = Vec::new();
        for run in iter {
            runs.push(run?);
        }
        Ok(runs)
    }

    // ========== 已恢复目录 ==========

    fn insert_restored_path(&mut self, row: &RestoredPathRow) -> Result<bool> {
        let inserted = self.connection.execute(
            &format!(
                "INSERT INTO restored_paths ({RESTORED_PATH_COLUMNS}) VALUES (?, ?, ?, ?) \
                 ON CONFLICT DO NOTHING"
            ),
            params![row.path, row.location_id, row.snapshot_id, row.restored_at],
        )?;
        Ok(inserted > 0)
    }

    fn list_restored_paths(&mut self) -> Result<Vec<RestoredPathRow>> {
        let mut stmt = self.connection.prepare(&format!(
            "SELECT {RESTORED_PATH_COLUMNS} FROM restored_paths ORDER BY restored_at, path"
        ))?;
        let iter = stmt.query_map([], |row| {
            Ok(RestoredPathRow {
                path: row.get(0)?,
                location_id: row.get(1)?,
                snapshot_id: row.get(2)?,
                restored_at: row.get(3)?,
            })
        })?;

        let mut paths = Vec::new();
        for path in iter {
            paths.push(path?);
        }
        Ok(paths)
    }
}

fn location_from_row(row: &Row<'_>) -> duckdb::Result<LocationRow> {
    Ok(LocationRow {
        id: row.get(0)?,
        repository_path: row.get(1)?,
        credential: row.get(2)?,
        known_paths: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> duckdb::Result<ScheduleRow> {
    Ok(ScheduleRow {
        id: row.get(0)?,
        location_id: row.get(1)?,
        kind: row.get(2)?,
        path_or_command: row.get(3)?,
        stdin_filename: row.get(4)?,
        frequency: row.get(5)?,
        time_of_day: row.get(6)?,
        created_at: row.get(7)?,
        last_run_at: row.get(8)?,
    })
}
