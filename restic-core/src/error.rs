use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResticError>;

#[derive(Error, Debug)]
pub enum ResticError {
    #[error("配置错误: {0}")]
    Config(#[from] toml::de::Error),

    #[error("配置序列化错误: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("配置文件未找到")]
    ConfigNotFound,

    #[error("DuckDB数据库错误: {0}")]
    DuckDb(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("UUID 错误: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("任务执行错误: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("无法启动进程: {0}")]
    Spawn(String),

    #[error("无法解析 restic 输出: {0}")]
    Parse(String),

    #[error("存储位置 {location_id} 已有任务在运行")]
    LockContention { location_id: String },

    #[error("restic 执行失败 (退出码 {code}): {message}")]
    ToolFailure { code: i32, message: String },

    #[error("存储位置不存在: {0}")]
    LocationNotFound(String),

    #[error("存储位置已存在: {0}")]
    LocationExists(String),

    #[error("快照不存在: {0}")]
    SnapshotNotFound(String),

    #[error("定时任务不存在: {0}")]
    ScheduleNotFound(String),

    #[error("日志不存在: {0}")]
    LogNotFound(String),

    #[error("路径不存在: {0}")]
    PathNotFound(String),

    #[error("无权访问该路径: {0}")]
    AccessDenied(String),

    #[error("参数无效: {0}")]
    InvalidInput(String),

    #[error("自定义错误: {0}")]
    Custom(String),
}

// 为DuckDB错误实现From trait
impl From<duckdb::Error> for ResticError {
    fn from(err: duckdb::Error) -> Self {
        ResticError::DuckDb(err.to_string())
    }
}

impl ResticError {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// 是否属于"找不到"类错误（调用方应按未命中处理，而不是故障）
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::LocationNotFound(_)
                | Self::SnapshotNotFound(_)
                | Self::ScheduleNotFound(_)
                | Self::LogNotFound(_)
                | Self::PathNotFound(_)
        )
    }
}
