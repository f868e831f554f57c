// 私有模块声明
mod app;
mod cli;
mod error;
mod init;
pub mod project_info; // 公开项目信息模块
pub mod routes;
mod utils;

// 通过 pub use 精确控制对外暴露的接口
pub use app::ResticApp;
pub use cli::{Cli, Commands};
pub use error::{ApiError, ApiResult};
pub use init::run_init;
pub use utils::setup_logging;
