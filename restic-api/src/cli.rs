use crate::project_info::{metadata, version_info};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Restic API - restic 备份/恢复 HTTP 服务
#[derive(Parser, Debug)]
#[command(name = "restic-api")]
#[command(about = metadata::PROJECT_DESCRIPTION)]
#[command(version = version_info::CLI_VERSION)]
#[command(long_about = metadata::display::DESCRIPTION_LONG)]
#[command(author = metadata::PROJECT_AUTHORS)]
pub struct Cli {
    /// 配置文件路径（不指定时依次查找 config.toml、restic-api.toml、.restic-api.toml）
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 详细输出
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// 启动 HTTP 服务和定时调度（默认）
    Serve {
        /// 覆盖配置中的监听地址，例如 0.0.0.0:5000
        #[arg(long)]
        bind: Option<String>,
    },
    /// 首次使用时初始化，创建配置文件、数据目录和数据库
    Init {
        /// 如果配置文件已存在，强制覆盖
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// 未指定子命令时按 `serve` 处理
    pub fn resolved_command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Serve { bind: None })
    }
}
