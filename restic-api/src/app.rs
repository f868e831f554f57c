use crate::routes::{self, AppState};
use axum::Router;
use restic_core::{
    config::AppConfig, database::Database, engine::JobEngine, error::Result,
    registry::LocationRegistry, restored::RestoredBrowser, scheduler::Scheduler,
};
use std::path::Path;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ResticApp {
    pub config: AppConfig,
    pub database: Database,
    pub engine: JobEngine,
    pub scheduler: Scheduler,
}

impl ResticApp {
    /// 加载配置并初始化应用：指定路径时直接加载，否则按默认文件名查找
    pub async fn new_with_config_path(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => AppConfig::load_from_file(path)?,
            None => AppConfig::find_and_load_config()?,
        };
        Self::new(config).await
    }

    pub async fn new(config: AppConfig) -> Result<Self> {
        // 确保数据目录存在
        config.ensure_data_dir()?;

        let db_path = config.get_database_path();
        let database = Database::connect(&db_path).await?;
        info!("数据库已连接: {}", db_path.display());

        let registry = LocationRegistry::load(database.clone()).await?;
        let engine = JobEngine::new(&config, database.clone(), registry);

        // 上次退出时未结束的任务补写失败日志
        let recovered = engine.recover_interrupted().await?;
        if recovered > 0 {
            warn!("{} 个任务在上次退出时被中断，已标记为失败", recovered);
        }

        let scheduler = Scheduler::new(&config, database.clone(), engine.clone());

        Ok(Self {
            config,
            database,
            engine,
            scheduler,
        })
    }

    pub fn router(&self) -> Router {
        routes::router(AppState::new(
            self.engine.clone(),
            self.scheduler.clone(),
            RestoredBrowser::new(self.database.clone()),
            self.config.api_token(),
        ))
    }

    /// 启动 HTTP 服务与定时调度，收到 Ctrl-C 后优雅退出
    pub async fn serve(self, bind_override: Option<String>) -> Result<()> {
        let bind = bind_override.unwrap_or_else(|| self.config.server.bind.clone());
        let listener = TcpListener::bind(&bind).await?;
        info!("HTTP 服务已启动: http://{}", listener.local_addr()?);
        if self.config.api_token().is_none() {
            warn!("未配置 server.api_token，接口不做鉴权");
        }

        let cancel = CancellationToken::new();
        let scheduler_task = if self.config.scheduler.enabled {
            Some(tokio::spawn(self.scheduler.clone().run(cancel.clone())))
        } else {
            info!("定时调度已禁用");
            None
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await?;

        cancel.cancel();
        if let Some(task) = scheduler_task {
            task.await?;
        }

        info!("服务已停止");
        Ok(())
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("收到退出信号，正在停止服务..."),
        Err(e) => {
            error!("无法监听退出信号: {}", e);
            // 无法监听信号时只能等待外部取消
            cancel.cancelled().await;
        }
    }
    cancel.cancel();
}
