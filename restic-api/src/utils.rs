use restic_core::constants::logging::{DEFAULT_LOG_LEVEL, LOG_FILE_ENV};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

/// # 日志系统使用说明
///
/// 1. **库代码只使用 `tracing` 宏**：`info!()`, `warn!()`, `error!()`, `debug!()`
/// 2. **应用入口控制日志配置**：在 `main.rs` 中调用 `setup_logging()`
///
/// ## 配置选项
///
/// - `-v, --verbose`：启用详细日志模式（DEBUG 级别）
/// - `RUST_LOG`：标准的 Rust 日志级别控制，优先于 `-v`
/// - `RESTIC_API_LOG_FILE`：日志文件路径，设置后日志写入文件而非终端
///
/// ```bash
/// # 详细日志输出到终端
/// restic-api -v serve
///
/// # 日志写入文件
/// RESTIC_API_LOG_FILE=/var/log/restic-api.log restic-api serve
///
/// # 只看调度器的调试日志
/// RUST_LOG=restic_core::scheduler=debug restic-api serve
/// ```
///
/// 写文件时返回的 [`WorkerGuard`] 必须在 `main` 中保留到进程退出，
/// 否则缓冲中的日志会丢失。
pub fn setup_logging(verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt};

    // 根据verbose参数和环境变量确定日志级别
    let default_level = if verbose { "debug" } else { DEFAULT_LOG_LEVEL };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var(LOG_FILE_ENV) {
        match open_log_file(Path::new(&log_file)) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                // 输出到文件 - 使用详细格式便于排查
                fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .init();
                return Some(guard);
            }
            Err(e) => {
                eprintln!("无法打开日志文件 {log_file}: {e}，改为输出到终端");
            }
        }
    }

    // 输出到终端 - 服务需要时间戳，不显示模块路径
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
    None
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}
