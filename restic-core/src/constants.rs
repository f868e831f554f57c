/// restic 工具相关常量
pub mod restic {
    /// 默认 restic 可执行文件名（通过 PATH 查找）
    pub const DEFAULT_BINARY: &str = "restic";

    /// 传递仓库密码的环境变量名
    pub const PASSWORD_ENV: &str = "RESTIC_PASSWORD";

    /// 备份 JSON 输出中结果行的 message_type
    pub const SUMMARY_MESSAGE_TYPE: &str = "summary";

    /// 命令备份时在仓库内保存的默认文件名
    pub const DEFAULT_STDIN_FILENAME: &str = "stdin";

    /// 执行命令备份所用的 shell
    pub const COMMAND_SHELL: &str = "sh";
}

/// 服务相关常量
pub mod server {
    /// 默认监听地址
    pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

    /// 共享密钥请求头前缀
    pub const BEARER_PREFIX: &str = "Bearer ";

    /// SSE 心跳间隔（秒）
    pub const SSE_KEEP_ALIVE_SECS: u64 = 15;

    /// 浏览已恢复内容的路由前缀
    pub const BROWSE_ROUTE: &str = "/browse";
}

/// 任务执行相关常量
pub mod job {
    /// 超时被终止的进程使用的合成退出码
    pub const TIMEOUT_EXIT_CODE: i32 = 124;

    /// 无法获取退出码时使用的合成退出码
    pub const UNKNOWN_EXIT_CODE: i32 = -1;

    /// 被信号终止时退出码的基数（128 + 信号编号）
    pub const SIGNAL_EXIT_BASE: i32 = 128;

    /// 进程退出后等待管道读取结束的时间（秒）
    pub const PIPE_DRAIN_GRACE_SECS: u64 = 2;

    /// 事件缓冲区默认容量
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

    /// 默认任务超时（0 表示不限制）
    pub const DEFAULT_TIMEOUT_SECS: u64 = 0;

    /// 恢复进度的报告步长（百分比）
    pub const PROGRESS_STEP_PERCENT: u8 = 5;

    /// 文件总数未知时，每处理这么多行报告一次
    pub const PROGRESS_FALLBACK_LINES: u64 = 100;

    /// 终止事件中的原因标记
    pub mod reason {
        pub const PARSE_FAILURE: &str = "parse-failure";
        pub const TOOL_FAILURE: &str = "tool-failure";
        pub const SPAWN_FAILURE: &str = "spawn-failure";
        pub const INTERRUPTED: &str = "interrupted";
        pub const LOG_WRITE_FAILURE: &str = "log-write-failure";
    }
}

/// 定时调度相关常量
pub mod scheduler {
    /// 到期检查默认间隔（秒）
    pub const DEFAULT_TICK_SECS: u64 = 60;

    /// time_of_day 的格式
    pub const TIME_OF_DAY_FORMAT: &str = "%H:%M";
}

/// 应用配置相关常量
pub mod config {
    use std::path::{Path, PathBuf};

    /// 数据目录名
    pub const DATA_DIR_NAME: &str = "data";

    /// 配置文件名
    pub const CONFIG_FILE_NAME: &str = "config.toml";

    /// 按优先级查找的配置文件名
    pub const CONFIG_FILE_CANDIDATES: [&str; 3] =
        ["config.toml", "restic-api.toml", ".restic-api.toml"];

    /// 数据库文件名
    pub const DATABASE_FILE_NAME: &str = "restic_api.db";

    /// 获取默认数据目录（跨平台）
    pub fn get_default_data_dir() -> PathBuf {
        Path::new(".").join(DATA_DIR_NAME)
    }
}

/// 日志相关常量
pub mod logging {
    /// 默认日志级别
    pub const DEFAULT_LOG_LEVEL: &str = "info";

    /// 日志文件路径环境变量
    pub const LOG_FILE_ENV: &str = "RESTIC_API_LOG_FILE";
}
