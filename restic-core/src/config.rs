use crate::constants::{config, job, restic, scheduler, server};
use crate::error::{Result, ResticError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub restic: ResticConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
}

/// HTTP 服务配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    /// 共享密钥，空字符串表示不校验
    #[serde(default)]
    pub api_token: String,
}

/// restic 工具配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResticConfig {
    pub binary: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default)]
    pub job_timeout_secs: u64,
}

/// 存储配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

/// 定时调度配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

/// 事件流配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_password_env() -> String {
    restic::PASSWORD_ENV.to_string()
}

fn default_database_file() -> String {
    config::DATABASE_FILE_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    scheduler::DEFAULT_TICK_SECS
}

fn default_buffer_capacity() -> usize {
    job::DEFAULT_BUFFER_CAPACITY
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: server::DEFAULT_BIND.to_string(),
                api_token: String::new(),
            },
            restic: ResticConfig {
                binary: restic::DEFAULT_BINARY.to_string(),
                password_env: default_password_env(),
                job_timeout_secs: job::DEFAULT_TIMEOUT_SECS,
            },
            storage: StorageConfig {
                data_dir: config::get_default_data_dir()
                    .to_string_lossy()
                    .to_string(),
                database_file: default_database_file(),
            },
            scheduler: SchedulerConfig {
                enabled: true,
                tick_secs: default_tick_secs(),
            },
            stream: StreamConfig {
                buffer_capacity: default_buffer_capacity(),
            },
        }
    }
}

impl AppConfig {
    /// 智能查找并加载配置文件
    /// 按优先级查找：config.toml -> restic-api.toml -> .restic-api.toml
    pub fn find_and_load_config() -> Result<Self> {
        for config_file in &config::CONFIG_FILE_CANDIDATES {
            if Path::new(config_file).exists() {
                tracing::info!("找到配置文件: {}", config_file);
                return Self::load_from_file(config_file);
            }
        }

        Err(ResticError::ConfigNotFound)
    }

    /// 从指定文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Err(ResticError::ConfigNotFound);
        }
        let content = fs::read_to_string(&path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_with_comments();
        fs::write(&path, content)?;
        Ok(())
    }

    /// 生成带注释的TOML配置
    fn to_toml_with_comments(&self) -> String {
        const TEMPLATE: &str = include_str!("../templates/config.toml.template");

        TEMPLATE
            .replace("{bind}", &self.server.bind)
            .replace("{api_token}", &self.server.api_token)
            .replace("{restic_binary}", &self.restic.binary)
            .replace("{password_env}", &self.restic.password_env)
            .replace(
                "{job_timeout_secs}",
                &self.restic.job_timeout_secs.to_string(),
            )
            .replace("{data_dir}", &self.storage.data_dir)
            .replace("{database_file}", &self.storage.database_file)
            .replace("{scheduler_enabled}", &self.scheduler.enabled.to_string())
            .replace("{tick_secs}", &self.scheduler.tick_secs.to_string())
            .replace(
                "{buffer_capacity}",
                &self.stream.buffer_capacity.to_string(),
            )
    }

    fn validate(&self) -> Result<()> {
        if self.restic.binary.trim().is_empty() {
            return Err(ResticError::invalid_input("restic.binary 不能为空"));
        }
        if self.restic.password_env.trim().is_empty() {
            return Err(ResticError::invalid_input("restic.password_env 不能为空"));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(ResticError::invalid_input("scheduler.tick_secs 必须大于 0"));
        }
        if self.stream.buffer_capacity == 0 {
            return Err(ResticError::invalid_input(
                "stream.buffer_capacity 必须大于 0",
            ));
        }
        Ok(())
    }

    /// 确保数据目录存在
    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.storage.data_dir)?;
        Ok(())
    }

    /// 获取数据库文件路径
    pub fn get_database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join(&self.storage.database_file)
    }

    /// 共享密钥（未配置时为 None）
    pub fn api_token(&self) -> Option<&str> {
        let token = self.server.api_token.trim();
        if token.is_empty() { None } else { Some(token) }
    }

    /// 单个任务的超时时间
    pub fn job_timeout(&self) -> Option<Duration> {
        match self.restic.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// 到期检查间隔
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_template_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.server.api_token = "s3cret".to_string();
        config.restic.job_timeout_secs = 3600;
        config.save_to_file(&path).unwrap();

        let loaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.api_token(), Some("s3cret"));
        assert_eq!(loaded.job_timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:8080"

[restic]
binary = "/usr/bin/restic"

[storage]
data_dir = "/var/lib/restic-api"

[scheduler]

[stream]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.api_token(), None);
        assert_eq!(config.restic.password_env, "RESTIC_PASSWORD");
        assert_eq!(config.job_timeout(), None);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.stream.buffer_capacity, 1024);
        assert_eq!(
            config.get_database_path(),
            PathBuf::from("/var/lib/restic-api").join("restic_api.db")
        );
    }

    #[test]
    fn test_missing_file_is_config_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ResticError::ConfigNotFound)));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.scheduler.tick_secs = 0;
        config.save_to_file(&path).unwrap();

        assert!(matches!(
            AppConfig::load_from_file(&path),
            Err(ResticError::InvalidInput(_))
        ));
    }
}
