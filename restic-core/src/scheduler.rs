//! 定时备份调度
//!
//! 定时任务持久化在数据库中，后台循环按固定间隔（对齐到整点边界）检查到期任务，
//! 到期后与手动触发走同一个引擎入口。时间按本地时区计算。

use crate::broadcaster::EventReceiver;
use crate::config::AppConfig;
use crate::constants::restic::DEFAULT_STDIN_FILENAME;
use crate::database::{Database, Frequency, Schedule, ScheduleKind};
use crate::engine::JobEngine;
use crate::restic::BackupSource;
use crate::{Result, ResticError};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, NaiveTime, Utc, Weekday};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 新建定时任务的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchedule {
    pub kind: ScheduleKind,
    pub path_or_command: String,
    /// 仅命令备份使用，缺省为 `stdin`
    pub stdin_filename: Option<String>,
    pub frequency: Frequency,
    pub time_of_day: NaiveTime,
}

/// 一次到期检查中单个定时任务的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// 已交给引擎执行
    Started,
    /// 存储位置正忙，下次检查时重试
    Busy,
    /// 触发失败，下次检查时重试
    Failed(String),
}

/// 计算 `anchor` 之后（不含）的第一个触发时刻
///
/// 每天：每天的 `time_of_day`；每周：每周日；每月：每月 1 日。
pub fn next_due_after(
    frequency: Frequency,
    time_of_day: NaiveTime,
    anchor: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let mut date = anchor.date();
    // 最长间隔为一个月，多留余量
    for _ in 0..64 {
        let matches = match frequency {
            Frequency::Daily => true,
            Frequency::Weekly => date.weekday() == Weekday::Sun,
            Frequency::Monthly => date.day() == 1,
        };
        if matches {
            let slot = date.and_time(time_of_day);
            if slot > anchor {
                return Some(slot);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// 距下一个整 `tick` 边界的时间
fn until_next_tick(now: DateTime<Utc>, tick: Duration) -> Duration {
    let tick_ms = i64::try_from(tick.as_millis()).unwrap_or(i64::MAX).max(1);
    let remainder = now.timestamp_millis().rem_euclid(tick_ms);
    Duration::from_millis(u64::try_from(tick_ms - remainder).unwrap_or(1))
}

fn source_of(schedule: &Schedule) -> BackupSource {
    match schedule.kind {
        ScheduleKind::Directory => BackupSource::directory(&schedule.path_or_command),
        ScheduleKind::Command => BackupSource::command(
            &schedule.path_or_command,
            schedule
                .stdin_filename
                .as_deref()
                .unwrap_or(DEFAULT_STDIN_FILENAME),
        ),
    }
}

/// 定时调度器
#[derive(Debug, Clone)]
pub struct Scheduler {
    database: Database,
    engine: JobEngine,
    tick: Duration,
}

impl Scheduler {
    pub fn new(config: &AppConfig, database: Database, engine: JobEngine) -> Self {
        Self {
            database,
            engine,
            tick: config.tick_interval(),
        }
    }

    /// 创建定时任务
    #[instrument(skip(self))]
    pub async fn create(&self, location_id: &str, request: NewSchedule) -> Result<Schedule> {
        self.engine.registry().get(location_id).await?;

        let path_or_command = request.path_or_command.trim().to_string();
        if path_or_command.is_empty() {
            return Err(ResticError::invalid_input("备份路径或命令不能为空"));
        }

        let stdin_filename = match request.kind {
            ScheduleKind::Directory => {
                if !Path::new(&path_or_command).exists() {
                    return Err(ResticError::invalid_input(format!(
                        "备份路径不存在: {path_or_command}"
                    )));
                }
                None
            }
            ScheduleKind::Command => {
                let filename = request
                    .stdin_filename
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| DEFAULT_STDIN_FILENAME.to_string());
                if filename.contains('/') {
                    return Err(ResticError::invalid_input(format!(
                        "无效的文件名: {filename}"
                    )));
                }
                Some(filename)
            }
        };

        let schedule = Schedule {
            schedule_id: Uuid::new_v4().to_string(),
            location_id: location_id.to_string(),
            kind: request.kind,
            path_or_command,
            stdin_filename,
            frequency: request.frequency,
            time_of_day: request.time_of_day,
            created_at: Utc::now(),
            last_run_at: None,
        };
        self.database.insert_schedule(&schedule).await?;

        info!(
            schedule_id = %schedule.schedule_id,
            location_id = %location_id,
            frequency = %schedule.frequency,
            "定时任务已创建"
        );
        Ok(schedule)
    }

    /// 列出存储位置的定时任务，按创建时间排序
    pub async fn list(&self, location_id: &str) -> Result<Vec<Schedule>> {
        self.engine.registry().get(location_id).await?;
        self.database.list_schedules(Some(location_id)).await
    }

    async fn get(&self, location_id: &str, schedule_id: &str) -> Result<Schedule> {
        self.database
            .get_schedule(schedule_id)
            .await?
            .filter(|s| s.location_id == location_id)
            .ok_or_else(|| ResticError::ScheduleNotFound(schedule_id.to_string()))
    }

    /// 删除定时任务
    #[instrument(skip(self))]
    pub async fn delete(&self, location_id: &str, schedule_id: &str) -> Result<()> {
        self.get(location_id, schedule_id).await?;
        if !self.database.delete_schedule(schedule_id).await? {
            return Err(ResticError::ScheduleNotFound(schedule_id.to_string()));
        }
        info!(schedule_id = %schedule_id, "定时任务已删除");
        Ok(())
    }

    /// 立即执行一次，不检查是否到期，也不更新 last_run_at
    #[instrument(skip(self))]
    pub async fn execute_now(&self, location_id: &str, schedule_id: &str) -> Result<EventReceiver> {
        let schedule = self.get(location_id, schedule_id).await?;
        self.engine
            .run_backup(&schedule.location_id, source_of(&schedule))
            .await
    }

    /// 在给定时刻做一次到期检查，返回到期任务的处理结果
    pub async fn tick_at(&self, now: DateTime<Local>) -> Vec<(String, TriggerOutcome)> {
        let schedules = match self.database.list_schedules(None).await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "读取定时任务失败");
                return Vec::new();
            }
        };

        let now_local = now.naive_local();
        let mut outcomes = Vec::new();
        for schedule in schedules {
            let anchor = schedule.last_run_at.unwrap_or(schedule.created_at);
            let anchor = anchor.with_timezone(&Local).naive_local();
            let Some(due) = next_due_after(schedule.frequency, schedule.time_of_day, anchor) else {
                continue;
            };
            if now_local < due {
                continue;
            }

            debug!(schedule_id = %schedule.schedule_id, due = %due, "定时任务到期");
            let outcome = self.trigger(&schedule, now.with_timezone(&Utc)).await;
            outcomes.push((schedule.schedule_id, outcome));
        }
        outcomes
    }

    /// 启动一次定时备份
    ///
    /// 执行时间在进程启动前写入，启动失败时恢复为原值。
    async fn trigger(&self, schedule: &Schedule, now: DateTime<Utc>) -> TriggerOutcome {
        let schedule_id = &schedule.schedule_id;
        let marked = AtomicBool::new(false);
        let mark = &marked;
        let database = &self.database;
        let started = self
            .engine
            .run_backup_with(&schedule.location_id, source_of(schedule), move || async move {
                database.update_schedule_last_run(schedule_id, Some(now)).await?;
                mark.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        if started.is_err() && marked.load(Ordering::SeqCst) {
            if let Err(e) = self
                .database
                .update_schedule_last_run(schedule_id, schedule.last_run_at)
                .await
            {
                error!(schedule_id = %schedule_id, error = %e, "恢复定时任务执行时间失败");
            }
        }

        match started {
            Ok(receiver) => {
                info!(schedule_id = %schedule_id, location_id = %schedule.location_id, "定时备份已启动");

                let schedule_id = schedule_id.clone();
                tokio::spawn(async move {
                    match receiver.wait_for_completion().await {
                        Some(done) if done.success => {
                            info!(schedule_id = %schedule_id, log_id = %done.log_id, "定时备份完成");
                        }
                        Some(done) => {
                            warn!(
                                schedule_id = %schedule_id,
                                log_id = %done.log_id,
                                reason = ?done.reason,
                                "定时备份失败"
                            );
                        }
                        None => warn!(schedule_id = %schedule_id, "定时备份未返回结果"),
                    }
                });
                TriggerOutcome::Started
            }
            Err(ResticError::LockContention { .. }) => {
                info!(schedule_id = %schedule_id, "存储位置正忙，下次检查时重试");
                TriggerOutcome::Busy
            }
            Err(e) => {
                if e.is_not_found() {
                    warn!(schedule_id = %schedule_id, error = %e, "定时备份无法执行");
                } else {
                    error!(schedule_id = %schedule_id, error = %e, "定时备份启动失败");
                }
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }

    /// 后台到期检查循环，直到 `cancel` 被取消
    pub async fn run(self, cancel: CancellationToken) {
        info!("定时调度已启动，检查间隔 {} 秒", self.tick.as_secs());

        loop {
            let wait = until_next_tick(Utc::now(), self.tick);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let outcomes = self.tick_at(Local::now()).await;
            if !outcomes.is_empty() {
                debug!("本次检查处理了 {} 个到期任务", outcomes.len());
            }
        }

        info!("定时调度已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_next_due_daily() {
        // 2025-03-05 是周三
        assert_eq!(
            next_due_after(Frequency::Daily, time(10, 30), at(2025, 3, 5, 9, 0)),
            Some(at(2025, 3, 5, 10, 30))
        );
        assert_eq!(
            next_due_after(Frequency::Daily, time(10, 30), at(2025, 3, 5, 10, 30)),
            Some(at(2025, 3, 6, 10, 30))
        );
        assert_eq!(
            next_due_after(Frequency::Daily, time(10, 30), at(2025, 12, 31, 23, 0)),
            Some(at(2026, 1, 1, 10, 30))
        );
    }

    #[test]
    fn test_next_due_weekly_and_monthly() {
        assert_eq!(
            next_due_after(Frequency::Weekly, time(2, 0), at(2025, 3, 5, 9, 0)),
            Some(at(2025, 3, 9, 2, 0))
        );
        assert_eq!(
            next_due_after(Frequency::Weekly, time(2, 0), at(2025, 3, 9, 2, 0)),
            Some(at(2025, 3, 16, 2, 0))
        );
        assert_eq!(
            next_due_after(Frequency::Monthly, time(0, 0), at(2025, 1, 15, 12, 0)),
            Some(at(2025, 2, 1, 0, 0))
        );
        assert_eq!(
            next_due_after(Frequency::Monthly, time(23, 59), at(2025, 2, 1, 8, 0)),
            Some(at(2025, 2, 1, 23, 59))
        );
    }

    #[test]
    fn test_until_next_tick_aligned() {
        let now = Utc.with_ymd_and_hms(2025, 3, 5, 10, 30, 15).unwrap();
        assert_eq!(
            until_next_tick(now, Duration::from_secs(60)),
            Duration::from_secs(45)
        );
        let on_boundary = Utc.with_ymd_and_hms(2025, 3, 5, 10, 31, 0).unwrap();
        assert_eq!(
            until_next_tick(on_boundary, Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[cfg(unix)]
    mod with_engine {
        use super::*;
        use crate::db::ScheduleRow;
        use crate::engine::tests::{Fixture, fixture, happy_backup_script, init_location};

        fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
            Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
        }

        async fn setup() -> (Fixture, Scheduler) {
            let fx = fixture(&happy_backup_script()).await;
            init_location(&fx).await;
            let scheduler = Scheduler::new(
                &AppConfig::default(),
                fx.database.clone(),
                fx.engine.clone(),
            );
            (fx, scheduler)
        }

        /// 直接写库，以便控制 created_at
        async fn insert_daily(fx: &Fixture, id: &str, location_id: &str, created: DateTime<Local>) {
            fx.database
                .insert_schedule(&Schedule {
                    schedule_id: id.to_string(),
                    location_id: location_id.to_string(),
                    kind: ScheduleKind::Directory,
                    path_or_command: fx.dir.path().to_string_lossy().to_string(),
                    stdin_filename: None,
                    frequency: Frequency::Daily,
                    time_of_day: time(10, 30),
                    created_at: created.with_timezone(&Utc),
                    last_run_at: None,
                })
                .await
                .unwrap();
        }

        async fn wait_until_idle(fx: &Fixture) {
            for _ in 0..100 {
                if !fx.engine.locks().is_locked("photos") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("任务未结束");
        }

        #[tokio::test]
        async fn test_fires_once_per_window() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "s1", "photos", local(2025, 3, 5, 9, 0)).await;

            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 31)).await;
            assert_eq!(outcomes, vec![("s1".to_string(), TriggerOutcome::Started)]);

            let schedule = fx.database.get_schedule("s1").await.unwrap().unwrap();
            assert_eq!(
                schedule.last_run_at,
                Some(local(2025, 3, 5, 10, 31).with_timezone(&Utc))
            );

            wait_until_idle(&fx).await;
            assert!(scheduler.tick_at(local(2025, 3, 5, 10, 32)).await.is_empty());
            assert_eq!(
                scheduler.tick_at(local(2025, 3, 6, 10, 30)).await,
                vec![("s1".to_string(), TriggerOutcome::Started)]
            );
        }

        #[tokio::test]
        async fn test_missed_windows_fire_once() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "s1", "photos", local(2025, 3, 1, 9, 0)).await;

            let outcomes = scheduler.tick_at(local(2025, 3, 5, 12, 0)).await;
            assert_eq!(outcomes.len(), 1);

            wait_until_idle(&fx).await;
            assert!(scheduler.tick_at(local(2025, 3, 5, 12, 1)).await.is_empty());
        }

        #[tokio::test]
        async fn test_busy_location_keeps_schedule_due() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "s1", "photos", local(2025, 3, 5, 9, 0)).await;

            let lease = fx.engine.locks().try_acquire("photos", "manual").unwrap();
            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 31)).await;
            assert_eq!(outcomes, vec![("s1".to_string(), TriggerOutcome::Busy)]);
            let schedule = fx.database.get_schedule("s1").await.unwrap().unwrap();
            assert!(schedule.last_run_at.is_none());

            drop(lease);
            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 32)).await;
            assert_eq!(outcomes, vec![("s1".to_string(), TriggerOutcome::Started)]);
            wait_until_idle(&fx).await;
        }

        #[tokio::test]
        async fn test_failing_schedule_does_not_block_others() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "a-ghost", "ghost", local(2025, 3, 5, 8, 0)).await;
            insert_daily(&fx, "b-real", "photos", local(2025, 3, 5, 9, 0)).await;

            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 31)).await;
            assert_eq!(outcomes.len(), 2);
            assert!(matches!(outcomes[0].1, TriggerOutcome::Failed(_)));
            assert_eq!(outcomes[1].1, TriggerOutcome::Started);

            let ghost = fx.database.get_schedule("a-ghost").await.unwrap().unwrap();
            assert!(ghost.last_run_at.is_none());
            wait_until_idle(&fx).await;
        }

        #[tokio::test]
        async fn test_unreadable_schedule_does_not_stall_tick() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "good", "photos", local(2025, 3, 5, 9, 0)).await;
            fx.database
                .insert_schedule_row(ScheduleRow {
                    id: "broken".to_string(),
                    location_id: "photos".to_string(),
                    kind: "directory".to_string(),
                    path_or_command: "/data".to_string(),
                    stdin_filename: None,
                    frequency: "fortnightly".to_string(),
                    time_of_day: "10:30".to_string(),
                    created_at: local(2025, 3, 5, 8, 0).with_timezone(&Utc),
                    last_run_at: None,
                })
                .await
                .unwrap();

            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 31)).await;
            assert_eq!(outcomes, vec![("good".to_string(), TriggerOutcome::Started)]);
            wait_until_idle(&fx).await;
        }

        #[tokio::test]
        async fn test_last_run_is_saved_before_process_starts() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "s1", "photos", local(2025, 3, 5, 9, 0)).await;
            std::fs::remove_file(fx.dir.path().join("restic")).unwrap();

            let outcomes = scheduler.tick_at(local(2025, 3, 5, 10, 31)).await;
            assert_eq!(outcomes, vec![("s1".to_string(), TriggerOutcome::Started)]);

            let schedule = fx.database.get_schedule("s1").await.unwrap().unwrap();
            assert_eq!(
                schedule.last_run_at,
                Some(local(2025, 3, 5, 10, 31).with_timezone(&Utc))
            );
            wait_until_idle(&fx).await;
            assert!(scheduler.tick_at(local(2025, 3, 5, 10, 32)).await.is_empty());
        }

        #[tokio::test]
        async fn test_create_list_delete() {
            let (fx, scheduler) = setup().await;

            let directory = scheduler
                .create(
                    "photos",
                    NewSchedule {
                        kind: ScheduleKind::Directory,
                        path_or_command: fx.dir.path().to_string_lossy().to_string(),
                        stdin_filename: None,
                        frequency: Frequency::Weekly,
                        time_of_day: time(3, 0),
                    },
                )
                .await
                .unwrap();
            let command = scheduler
                .create(
                    "photos",
                    NewSchedule {
                        kind: ScheduleKind::Command,
                        path_or_command: "pg_dumpall".to_string(),
                        stdin_filename: None,
                        frequency: Frequency::Daily,
                        time_of_day: time(1, 0),
                    },
                )
                .await
                .unwrap();
            assert_eq!(command.stdin_filename.as_deref(), Some("stdin"));

            let missing_path = scheduler
                .create(
                    "photos",
                    NewSchedule {
                        kind: ScheduleKind::Directory,
                        path_or_command: "/no/such/dir/here".to_string(),
                        stdin_filename: None,
                        frequency: Frequency::Daily,
                        time_of_day: time(1, 0),
                    },
                )
                .await;
            assert!(matches!(missing_path, Err(ResticError::InvalidInput(_))));
            assert!(matches!(
                scheduler.list("ghost").await,
                Err(ResticError::LocationNotFound(_))
            ));

            let ids: Vec<_> = scheduler
                .list("photos")
                .await
                .unwrap()
                .into_iter()
                .map(|s| s.schedule_id)
                .collect();
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&directory.schedule_id));

            scheduler
                .delete("photos", &directory.schedule_id)
                .await
                .unwrap();
            assert!(matches!(
                scheduler.delete("photos", &directory.schedule_id).await,
                Err(ResticError::ScheduleNotFound(_))
            ));
            assert_eq!(scheduler.list("photos").await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_execute_now_leaves_last_run_untouched() {
            let (fx, scheduler) = setup().await;
            insert_daily(&fx, "s1", "photos", local(2025, 3, 5, 9, 0)).await;

            let completion = scheduler
                .execute_now("photos", "s1")
                .await
                .unwrap()
                .wait_for_completion()
                .await
                .unwrap();
            assert!(completion.success);

            let schedule = fx.database.get_schedule("s1").await.unwrap().unwrap();
            assert!(schedule.last_run_at.is_none());
            assert!(matches!(
                scheduler.execute_now("other", "s1").await,
                Err(ResticError::ScheduleNotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_run_loop_stops_on_cancel() {
            let (_fx, scheduler) = setup().await;
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(scheduler.run(cancel.clone()));

            cancel.cancel();
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
