//! 任务执行引擎
//!
//! 在进程执行器之上加入 restic 语义：按存储位置互斥、快照ID提取、
//! 任务日志落库。备份与恢复在任务登记后立即返回事件接收端，
//! 进程由独立任务启动并推送事件，调用方断开不会中止任务。

use crate::broadcaster::{
    EventReceiver, EventSender, JobCompletion, JobEvent, RestoreProgress, event_channel,
};
use crate::config::AppConfig;
use crate::constants::job::{
    PROGRESS_FALLBACK_LINES, PROGRESS_STEP_PERCENT, UNKNOWN_EXIT_CODE, reason,
};
use crate::database::{
    Credential, Database, JobLog, JobRun, JobState, Location, Operation, RestoredPath,
};
use crate::parser;
use crate::registry::LocationRegistry;
use crate::restic::{
    self, BackupSource, RestoreOptions, ResticTool, SnapshotEntry, SnapshotInfo,
};
use crate::restored;
use crate::runner::{
    OutputStream, ProcessEvent, ProcessExit, ProcessHandle, ProcessRunner, ProcessSpec,
};
use crate::{Result, ResticError};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 存储位置锁表：location_id -> 正在运行的 job_id
#[derive(Debug, Clone, Default)]
pub struct JobLocks {
    held: Arc<DashMap<String, String>>,
}

impl JobLocks {
    /// 尝试占用存储位置，已被占用时返回 [`ResticError::LockContention`]
    pub fn try_acquire(&self, location_id: &str, job_id: &str) -> Result<LocationLease> {
        match self.held.entry(location_id.to_string()) {
            Entry::Occupied(entry) => {
                warn!(
                    location_id = %location_id,
                    running_job = %entry.get(),
                    "存储位置已有任务在运行，拒绝新任务"
                );
                Err(ResticError::LockContention {
                    location_id: location_id.to_string(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(job_id.to_string());
                Ok(LocationLease {
                    held: self.held.clone(),
                    location_id: location_id.to_string(),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    pub fn is_locked(&self, location_id: &str) -> bool {
        self.held.contains_key(location_id)
    }
}

/// 存储位置占用凭证，释放时解除占用
#[derive(Debug)]
pub struct LocationLease {
    held: Arc<DashMap<String, String>>,
    location_id: String,
    job_id: String,
}

impl Drop for LocationLease {
    fn drop(&mut self) {
        self.held
            .remove_if(&self.location_id, |_, job_id| job_id == &self.job_id);
        debug!(location_id = %self.location_id, job_id = %self.job_id, "存储位置已释放");
    }
}

/// 正在执行的任务
#[derive(Debug, Clone)]
struct Job {
    job_id: String,
    location_id: String,
    operation: Operation,
    target_path: String,
    /// 恢复任务的源快照
    snapshot_id: Option<String>,
    dry_run: bool,
}

/// 任务执行计划
#[derive(Debug)]
struct JobPlan {
    spec: ProcessSpec,
    /// 恢复前统计快照文件数的命令
    count: Option<ProcessSpec>,
}

/// 任务结果
#[derive(Debug)]
struct JobOutcome {
    success: bool,
    snapshot_id: Option<String>,
    reason: Option<String>,
    output: String,
}

impl JobOutcome {
    fn failed(reason: String, output: String) -> Self {
        Self {
            success: false,
            snapshot_id: None,
            reason: Some(reason),
            output,
        }
    }
}

/// 任务执行引擎
#[derive(Debug, Clone)]
pub struct JobEngine {
    registry: LocationRegistry,
    database: Database,
    runner: ProcessRunner,
    tool: ResticTool,
    locks: JobLocks,
    buffer_capacity: usize,
}

impl JobEngine {
    pub fn new(config: &AppConfig, database: Database, registry: LocationRegistry) -> Self {
        Self {
            registry,
            database,
            runner: ProcessRunner::new(config.job_timeout()),
            tool: ResticTool::from_config(&config.restic),
            locks: JobLocks::default(),
            buffer_capacity: config.stream.buffer_capacity,
        }
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// 初始化 restic 仓库并注册为存储位置
    #[instrument(skip(self, password))]
    pub async fn initialize_repository(
        &self,
        repository_path: &str,
        password: &str,
    ) -> Result<Location> {
        let repository_path = repository_path.trim();
        if repository_path.is_empty() {
            return Err(ResticError::invalid_input("仓库路径不能为空"));
        }
        if password.is_empty() {
            return Err(ResticError::invalid_input("仓库密码不能为空"));
        }

        let location_id = LocationRegistry::derive_location_id(repository_path)?;
        if self.registry.contains(&location_id).await {
            return Err(ResticError::LocationExists(location_id));
        }

        if let Some(parent) = Path::new(repository_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            if !parent.exists() {
                return Err(ResticError::invalid_input(format!(
                    "仓库所在目录不存在: {}",
                    parent.display()
                )));
            }
        }

        // 初始化期间占用该存储位置，避免并发初始化同一仓库
        let _lease = self
            .locks
            .try_acquire(&location_id, &Uuid::new_v4().to_string())?;

        let credential = Credential::new(password);
        info!(location_id = %location_id, "正在初始化 restic 仓库");
        let output = self
            .runner
            .start(self.tool.init(repository_path, &credential))?
            .collect()
            .await;
        if !output.exit.success() {
            return Err(restic::tool_failure(&output));
        }

        self.registry
            .register(&location_id, repository_path, credential)
            .await
    }

    /// 列出全部存储位置
    pub async fn list_locations(&self) -> Vec<Location> {
        self.registry.list().await
    }

    /// 列出快照
    #[instrument(skip(self))]
    pub async fn list_snapshots(
        &self,
        location_id: &str,
        filter_path: Option<&str>,
    ) -> Result<Vec<SnapshotInfo>> {
        let location = self.registry.get(location_id).await?;
        let output = self
            .runner
            .start(self.tool.snapshots(
                &location.repository_path,
                &location.credential,
                filter_path,
            ))?
            .collect()
            .await;
        if !output.exit.success() {
            return Err(restic::tool_failure(&output));
        }

        restic::parse_snapshots(&output.stdout_text())
    }

    /// 浏览快照中的目录
    #[instrument(skip(self))]
    pub async fn browse_snapshot(
        &self,
        location_id: &str,
        snapshot_id: &str,
        directory_path: &str,
        recursive: bool,
    ) -> Result<Vec<SnapshotEntry>> {
        if snapshot_id.trim().is_empty() {
            return Err(ResticError::invalid_input("快照ID不能为空"));
        }
        let location = self.registry.get(location_id).await?;
        let output = self
            .runner
            .start(self.tool.ls(
                &location.repository_path,
                &location.credential,
                snapshot_id,
                directory_path,
                recursive,
            ))?
            .collect()
            .await;
        if !output.exit.success() {
            if restic::is_snapshot_not_found(&output.stderr_text()) {
                return Err(ResticError::SnapshotNotFound(snapshot_id.to_string()));
            }
            return Err(restic::tool_failure(&output));
        }

        Ok(restic::parse_ls(&output.stdout_text()))
    }

    /// 启动备份任务，返回事件接收端
    pub async fn run_backup(
        &self,
        location_id: &str,
        source: BackupSource,
    ) -> Result<EventReceiver> {
        self.run_backup_with(location_id, source, || async { Ok(()) })
            .await
    }

    /// 启动备份任务
    ///
    /// `before_start` 在占用存储位置之后、启动进程之前执行；返回错误时任务不会启动，
    /// 存储位置随即释放。
    #[instrument(skip(self, before_start))]
    pub async fn run_backup_with<F, Fut>(
        &self,
        location_id: &str,
        source: BackupSource,
        before_start: F,
    ) -> Result<EventReceiver>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match &source {
            BackupSource::Directory { path } => {
                if path.trim().is_empty() {
                    return Err(ResticError::invalid_input("备份路径不能为空"));
                }
                if !Path::new(path).exists() {
                    return Err(ResticError::invalid_input(format!("备份路径不存在: {path}")));
                }
            }
            BackupSource::Command {
                command,
                stdin_filename,
            } => {
                if command.trim().is_empty() {
                    return Err(ResticError::invalid_input("备份命令不能为空"));
                }
                if stdin_filename.is_empty() || stdin_filename.contains('/') {
                    return Err(ResticError::invalid_input(format!(
                        "无效的文件名: {stdin_filename}"
                    )));
                }
            }
        }

        let location = self.registry.get(location_id).await?;
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            location_id: location.id.clone(),
            operation: Operation::Backup,
            target_path: source.target_path(),
            snapshot_id: None,
            dry_run: false,
        };
        let plan = JobPlan {
            spec: self
                .tool
                .backup(&location.repository_path, &location.credential, &source),
            count: None,
        };

        self.start_job(job, plan, "开始备份", before_start).await
    }

    /// 启动恢复任务，返回事件接收端
    ///
    /// 进程启动前先统计快照中的文件数，用于计算恢复进度。
    #[instrument(skip(self))]
    pub async fn run_restore(
        &self,
        location_id: &str,
        options: RestoreOptions,
    ) -> Result<EventReceiver> {
        if options.snapshot_id.trim().is_empty() {
            return Err(ResticError::invalid_input("快照ID不能为空"));
        }
        if options.target.trim().is_empty() {
            return Err(ResticError::invalid_input("恢复目标路径不能为空"));
        }

        let location = self.registry.get(location_id).await?;
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            location_id: location.id.clone(),
            operation: Operation::Restore,
            target_path: options.target.clone(),
            snapshot_id: Some(options.snapshot_id.clone()),
            dry_run: options.dry_run,
        };
        let plan = JobPlan {
            spec: self
                .tool
                .restore(&location.repository_path, &location.credential, &options),
            count: Some(self.tool.ls(
                &location.repository_path,
                &location.credential,
                &options.snapshot_id,
                "/",
                true,
            )),
        };

        self.start_job(job, plan, "开始恢复", || async { Ok(()) })
            .await
    }

    /// 获取任务日志（键为快照ID或任务ID）
    pub async fn get_log(&self, log_id: &str) -> Result<JobLog> {
        self.database
            .get_job_log(log_id)
            .await?
            .ok_or_else(|| ResticError::LogNotFound(log_id.to_string()))
    }

    /// 启动时调用：把上次退出时仍在运行的任务标记为失败，并补写日志
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let runs = self.database.get_job_runs_by_state(JobState::Running).await?;
        for run in &runs {
            warn!(job_id = %run.job_id, location_id = %run.location_id, "发现被中断的任务");
            let log = JobLog {
                log_id: run.job_id.clone(),
                job_id: run.job_id.clone(),
                location_id: run.location_id.clone(),
                operation: run.operation,
                success: false,
                reason: Some(reason::INTERRUPTED.to_string()),
                output: String::new(),
                created_at: Utc::now(),
            };
            if self.database.get_job_log(&log.log_id).await?.is_none() {
                self.database.insert_job_log(&log).await?;
            }
            self.database
                .finish_job_run(&run.job_id, JobState::Failed, Utc::now())
                .await?;
        }

        if !runs.is_empty() {
            info!("已恢复 {} 个被中断的任务", runs.len());
        }
        Ok(runs.len())
    }

    async fn start_job<F, Fut>(
        &self,
        job: Job,
        plan: JobPlan,
        message: &str,
        before_start: F,
    ) -> Result<EventReceiver>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let lease = self.locks.try_acquire(&job.location_id, &job.job_id)?;
        before_start().await?;

        self.database
            .insert_job_run(&JobRun {
                job_id: job.job_id.clone(),
                location_id: job.location_id.clone(),
                operation: job.operation,
                target_path: job.target_path.clone(),
                state: JobState::Running,
                started_at: Utc::now(),
                finished_at: None,
            })
            .await?;

        let (sender, receiver) = event_channel(self.buffer_capacity);
        sender.send(JobEvent::Started {
            message: message.to_string(),
            job_id: job.job_id.clone(),
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.execute(&job, plan, &sender).await;
            engine.finish(&job, lease, &sender, outcome).await;
        });

        Ok(receiver)
    }

    /// 启动进程并转发输出；恢复任务先统计文件数
    async fn execute(&self, job: &Job, plan: JobPlan, sender: &EventSender) -> JobOutcome {
        let total = match plan.count {
            Some(count) => {
                sender.send(JobEvent::Message {
                    message: "正在统计快照中的文件数...".to_string(),
                });
                let total = self.count_entries(job, count).await;
                let message = match total {
                    Some(total) => format!("共 {total} 个文件，开始恢复"),
                    None => "无法获取文件数，开始恢复".to_string(),
                };
                sender.send(JobEvent::Message { message });
                total
            }
            None => None,
        };

        match self.runner.start(plan.spec) {
            Ok(handle) => {
                info!(
                    job_id = %job.job_id,
                    location_id = %job.location_id,
                    operation = %job.operation,
                    pid = ?handle.pid(),
                    "任务已启动"
                );
                drive(job, handle, sender, total).await
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "任务进程启动失败");
                JobOutcome::failed(format!("{}: {e}", reason::SPAWN_FAILURE), e.to_string())
            }
        }
    }

    /// 统计快照中的条目数，失败或为空时返回 None
    async fn count_entries(&self, job: &Job, spec: ProcessSpec) -> Option<u64> {
        let output = match self.runner.start(spec) {
            Ok(handle) => handle.collect().await,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "统计快照文件数失败");
                return None;
            }
        };
        if !output.exit.success() {
            warn!(job_id = %job.job_id, code = output.exit.code, "统计快照文件数失败");
            return None;
        }

        let total = restic::parse_ls(&output.stdout_text()).len() as u64;
        (total > 0).then_some(total)
    }

    /// 记录恢复目标目录，返回浏览地址
    async fn record_restored_path(&self, job: &Job) -> Option<String> {
        let path = tokio::fs::canonicalize(&job.target_path)
            .await
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| job.target_path.clone());
        let entry = RestoredPath {
            path: path.clone(),
            location_id: job.location_id.clone(),
            snapshot_id: job.snapshot_id.clone().unwrap_or_default(),
            restored_at: Utc::now(),
        };

        match self.database.record_restored_path(&entry).await {
            Ok(_) => Some(restored::browse_link(&path)),
            Err(e) => {
                warn!(job_id = %job.job_id, path = %path, error = %e, "记录恢复目录失败");
                None
            }
        }
    }

    /// 写日志、更新运行记录、释放存储位置，最后发送终止事件
    async fn finish(
        &self,
        job: &Job,
        lease: LocationLease,
        sender: &EventSender,
        outcome: JobOutcome,
    ) {
        let mut browse_link = None;
        if outcome.success {
            match job.operation {
                Operation::Backup => {
                    if let Err(e) = self
                        .registry
                        .learn_path(&job.location_id, &job.target_path)
                        .await
                    {
                        warn!(job_id = %job.job_id, error = %e, "记录备份路径失败");
                    }
                }
                Operation::Restore if !job.dry_run => {
                    browse_link = self.record_restored_path(job).await;
                }
                Operation::Restore => {}
            }
        }

        let log_id = outcome
            .snapshot_id
            .clone()
            .unwrap_or_else(|| job.job_id.clone());
        let log = JobLog {
            log_id: log_id.clone(),
            job_id: job.job_id.clone(),
            location_id: job.location_id.clone(),
            operation: job.operation,
            success: outcome.success,
            reason: outcome.reason.clone(),
            output: outcome.output,
            created_at: Utc::now(),
        };

        // 日志写入失败时记入终止事件的 reason
        let mut completion_reason = outcome.reason;
        if let Err(e) = self.database.insert_job_log(&log).await {
            error!(job_id = %job.job_id, log_id = %log_id, error = %e, "写入任务日志失败");
            let failure = format!("{}: {e}", reason::LOG_WRITE_FAILURE);
            completion_reason = Some(match completion_reason {
                Some(existing) => format!("{existing}; {failure}"),
                None => failure,
            });
        }

        let state = if outcome.success {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        if let Err(e) = self
            .database
            .finish_job_run(&job.job_id, state, Utc::now())
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "更新任务运行记录失败");
        }

        drop(lease);

        info!(
            job_id = %job.job_id,
            location_id = %job.location_id,
            operation = %job.operation,
            success = outcome.success,
            reason = ?completion_reason,
            "任务已结束"
        );
        let completion = JobCompletion::new(
            outcome.success,
            outcome.snapshot_id,
            completion_reason,
            log_id,
        )
        .with_browse_link(browse_link);
        if !sender.send(JobEvent::Completed(completion)) {
            debug!(job_id = %job.job_id, "事件接收方已断开，日志已保存");
        }
    }
}

/// 恢复进度计算，每行标准输出计为处理了一个文件
#[derive(Debug)]
struct ProgressTracker {
    total: Option<u64>,
    processed: u64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    fn new(total: Option<u64>) -> Self {
        Self {
            total,
            processed: 0,
            last_percent: None,
        }
    }

    /// 已知总数时每跨过一个 5% 报告一次；总数未知时每 100 行报告一次
    fn advance(&mut self) -> Option<RestoreProgress> {
        self.processed += 1;
        let processed = self.processed;

        match self.total {
            Some(total) => {
                let percent = (processed.saturating_mul(100) / total.max(1)).min(100) as u8;
                if self.last_percent == Some(percent) || percent % PROGRESS_STEP_PERCENT != 0 {
                    return None;
                }
                self.last_percent = Some(percent);
                Some(RestoreProgress {
                    progress: Some(percent),
                    processed,
                    total: Some(total),
                    message: None,
                })
            }
            None => (processed % PROGRESS_FALLBACK_LINES == 0).then(|| RestoreProgress {
                progress: None,
                processed,
                total: None,
                message: Some(format!("已处理 {processed} 个文件...")),
            }),
        }
    }
}

/// 转发进程输出，直到进程退出，返回任务结果
async fn drive(
    job: &Job,
    mut handle: ProcessHandle,
    sender: &EventSender,
    total: Option<u64>,
) -> JobOutcome {
    let mut captured = Vec::new();
    let mut stdout = Vec::new();
    let mut progress = ProgressTracker::new(total);

    let exit = loop {
        match handle.next_event().await {
            Some(ProcessEvent::Output { stream, line }) => {
                if stream == OutputStream::Stdout {
                    stdout.push(line.clone());
                }
                captured.push(line.clone());
                sender.send(JobEvent::Output { output: line });

                if job.operation == Operation::Restore && stream == OutputStream::Stdout {
                    if let Some(update) = progress.advance() {
                        sender.send(JobEvent::Progress(update));
                    }
                }
            }
            Some(ProcessEvent::Exited(exit)) => break exit,
            None => {
                break ProcessExit {
                    code: UNKNOWN_EXIT_CODE,
                    reason: Some("进程事件流提前结束".to_string()),
                };
            }
        }
    };

    if let Some(exit_reason) = &exit.reason {
        captured.push(exit_reason.clone());
    }
    let output = captured.join("\n");

    if !exit.success() {
        warn!(job_id = %job.job_id, code = exit.code, "restic 退出码非零");
        return JobOutcome::failed(
            format!("{}: exit code {}", reason::TOOL_FAILURE, exit.code),
            output,
        );
    }

    match job.operation {
        Operation::Backup => match parser::extract_snapshot_id(&stdout) {
            Ok(snapshot_id) => JobOutcome {
                success: true,
                snapshot_id: Some(snapshot_id),
                reason: None,
                output,
            },
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "无法从备份输出中提取快照ID");
                JobOutcome::failed(reason::PARSE_FAILURE.to_string(), output)
            }
        },
        Operation::Restore => JobOutcome {
            success: true,
            snapshot_id: None,
            reason: None,
            output,
        },
    }
}
