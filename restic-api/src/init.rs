use restic_core::{
    config::AppConfig,
    constants::config::{CONFIG_FILE_NAME, DATA_DIR_NAME},
    database::Database,
    error::Result,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 运行独立的初始化流程
pub async fn run_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    info!("Restic API 初始化");
    info!("======================");

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    // 检查是否已经初始化过
    if !force && config_path.exists() {
        warn!("检测到已存在的配置文件: {}", config_path.display());
        info!("如果您要重新初始化，请使用 --force 参数");
        info!("示例: restic-api init --force");
        return Ok(());
    }

    info!("步骤 1: 创建配置文件和数据目录");

    // 指定了配置文件所在目录时，数据目录放在它旁边
    let mut config = AppConfig::default();
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        config.storage.data_dir = parent.join(DATA_DIR_NAME).to_string_lossy().to_string();
    }
    config.save_to_file(&config_path)?;
    info!("   创建配置文件: {}", config_path.display());

    config.ensure_data_dir()?;
    info!("   创建数据目录: {}", config.storage.data_dir);

    info!("步骤 2: 初始化数据库");

    let db_path = config.get_database_path();
    Database::connect(&db_path).await?;
    info!("   创建DuckDB数据库: {}", db_path.display());

    info!("初始化完成！");
    info!("");
    info!("接下来的步骤:");
    info!("   1. 确认已安装 restic，或在配置文件中指定 restic.binary");
    info!("   2. 如需校验请求，设置 server.api_token");
    info!("   3. 运行 'restic-api serve' 启动服务");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        run_init(Some(&config_path), false).await.unwrap();
        let config = AppConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.server, AppConfig::default().server);
        assert_eq!(
            PathBuf::from(&config.storage.data_dir),
            dir.path().join("data")
        );
        assert!(config.get_database_path().exists());

        // 已存在且未指定 --force 时保持原样
        std::fs::write(&config_path, "# custom").unwrap();
        run_init(Some(&config_path), false).await.unwrap();
        assert_eq!(std::fs::read_to_string(&config_path).unwrap(), "# custom");
    }
}
