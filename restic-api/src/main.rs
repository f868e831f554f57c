use clap::Parser;
use restic_api::{Cli, Commands, ResticApp, project_info, run_init, setup_logging};
use restic_core::ResticError;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let cli = Cli::parse();

    // 设置日志记录，写文件时 guard 需要保留到退出
    let guard = setup_logging(cli.verbose);

    let outcome = match cli.resolved_command() {
        // `init` 命令是特例，它不需要预先加载配置
        Commands::Init { force } => run_init(cli.config.as_deref(), force)
            .await
            .map_err(|e| format!("初始化失败: {e}")),
        Commands::Serve { bind } => {
            info!("{} 启动中", project_info::get_version_string());
            match ResticApp::new_with_config_path(cli.config.as_deref()).await {
                Ok(app) => app
                    .serve(bind)
                    .await
                    .map_err(|e| format!("服务运行失败: {e}")),
                Err(ResticError::ConfigNotFound) => {
                    match &cli.config {
                        Some(path) => error!("配置文件 '{}' 未找到。", path.display()),
                        None => error!("当前目录下未找到配置文件。"),
                    }
                    Err("请先运行 'restic-api init' 命令来创建配置文件。".to_string())
                }
                Err(e) => Err(format!("应用初始化失败: {e}")),
            }
        }
    };

    if let Err(message) = outcome {
        error!("{}", message);
        drop(guard);
        std::process::exit(1);
    }
}
