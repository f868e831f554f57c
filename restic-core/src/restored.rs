//! 已恢复目录的只读访问
//!
//! 只允许访问恢复成功后登记过的目标目录及其子路径，
//! 路径先做规范化（解析符号链接）再与登记的目录比较。

use crate::constants::server::BROWSE_ROUTE;
use crate::database::{Database, RestoredPath};
use crate::{Result, ResticError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// 恢复目录对应的浏览地址
pub fn browse_link(path: &str) -> String {
    if path.starts_with('/') {
        format!("{BROWSE_ROUTE}{path}")
    } else {
        format!("{BROWSE_ROUTE}/{path}")
    }
}

/// 本地目录中的一项
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LocalEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RestoredBrowser {
    database: Database,
}

impl RestoredBrowser {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// 列出全部已登记的恢复目录
    pub async fn list_roots(&self) -> Result<Vec<RestoredPath>> {
        self.database.list_restored_paths().await
    }

    /// 列出目录内容，目录在前，同类按名称排序
    pub async fn list_dir(&self, requested: &str) -> Result<Vec<LocalEntry>> {
        let dir = self.resolve(requested).await?;
        if !tokio::fs::metadata(&dir).await?.is_dir() {
            return Err(ResticError::invalid_input(format!("不是目录: {requested}")));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "跳过无法读取的目录项");
                    continue;
                }
            };
            let is_dir = metadata.is_dir();
            entries.push(LocalEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.path().to_string_lossy().to_string(),
                is_dir,
                size: (!is_dir).then_some(metadata.len()),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// 读取文件内容
    pub async fn read_file(&self, requested: &str) -> Result<Vec<u8>> {
        let file = self.resolve(requested).await?;
        if tokio::fs::metadata(&file).await?.is_dir() {
            return Err(ResticError::invalid_input(format!("不是文件: {requested}")));
        }
        Ok(tokio::fs::read(&file).await?)
    }

    /// 规范化请求路径，并确认它位于某个已登记的恢复目录之下
    async fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let path = Path::new(requested);
        if !path.is_absolute() {
            return Err(ResticError::invalid_input(format!("路径必须为绝对路径: {requested}")));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ResticError::invalid_input(format!("路径不能包含 '..': {requested}")));
        }

        let mut roots = Vec::new();
        for restored in self.list_roots().await? {
            match tokio::fs::canonicalize(&restored.path).await {
                Ok(root) => roots.push(root),
                Err(e) => debug!(path = %restored.path, error = %e, "恢复目录已不存在"),
            }
        }

        match tokio::fs::canonicalize(path).await {
            Ok(real) if roots.iter().any(|root| real.starts_with(root)) => Ok(real),
            Ok(real) => {
                warn!(requested = %requested, resolved = %real.display(), "拒绝访问未登记的路径");
                Err(ResticError::AccessDenied(requested.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if roots.iter().any(|root| path.starts_with(root)) {
                    Err(ResticError::PathNotFound(requested.to_string()))
                } else {
                    Err(ResticError::AccessDenied(requested.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        outside: PathBuf,
        browser: RestoredBrowser,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let root = base.join("restored");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("docs").join("a.txt"), "hello").unwrap();
        std::fs::write(root.join("b.bin"), [0u8, 159, 146, 150]).unwrap();

        let outside = base.join("secret.txt");
        std::fs::write(&outside, "top secret").unwrap();

        let database = Database::connect_memory().await.unwrap();
        database
            .record_restored_path(&RestoredPath {
                path: root.to_string_lossy().to_string(),
                location_id: "photos".to_string(),
                snapshot_id: "aaaabbbb".to_string(),
                restored_at: Utc::now(),
            })
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            root,
            outside,
            browser: RestoredBrowser::new(database),
        }
    }

    fn text(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_browse_link() {
        assert_eq!(browse_link("/tmp/out"), "/browse/tmp/out");
        assert_eq!(browse_link("tmp/out"), "/browse/tmp/out");
    }

    #[tokio::test]
    async fn test_list_restored_dir() {
        let fx = fixture().await;

        let roots = fx.browser.list_roots().await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].path, text(&fx.root));

        let entries = fx.browser.list_dir(&text(&fx.root)).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "b.bin"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].size, Some(4));

        let nested = fx.browser.list_dir(&text(&fx.root.join("docs"))).await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].path, text(&fx.root.join("docs").join("a.txt")));
    }

    #[tokio::test]
    async fn test_read_restored_file() {
        let fx = fixture().await;
        let bytes = fx
            .browser
            .read_file(&text(&fx.root.join("docs").join("a.txt")))
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");

        let dir = fx.browser.read_file(&text(&fx.root)).await;
        assert!(matches!(dir, Err(ResticError::InvalidInput(_))));

        let file = fx.browser.list_dir(&text(&fx.root.join("b.bin"))).await;
        assert!(matches!(file, Err(ResticError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_paths_outside_restored_dirs_are_denied() {
        let fx = fixture().await;

        let outside = fx.browser.read_file(&text(&fx.outside)).await;
        assert!(matches!(outside, Err(ResticError::AccessDenied(_))));

        let etc = fx.browser.list_dir("/etc").await;
        assert!(matches!(etc, Err(ResticError::AccessDenied(_))));

        let missing_outside = fx.browser.list_dir("/definitely/not/here").await;
        assert!(matches!(missing_outside, Err(ResticError::AccessDenied(_))));

        let traversal = format!("{}/../secret.txt", text(&fx.root));
        let traversal = fx.browser.read_file(&traversal).await;
        assert!(matches!(traversal, Err(ResticError::InvalidInput(_))));

        let relative = fx.browser.list_dir("restored").await;
        assert!(matches!(relative, Err(ResticError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_missing_path_inside_restored_dir() {
        let fx = fixture().await;
        let missing = fx
            .browser
            .read_file(&text(&fx.root.join("nope.txt")))
            .await;
        assert!(matches!(missing, Err(ResticError::PathNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_denied() {
        let fx = fixture().await;
        let link = fx.root.join("escape");
        std::os::unix::fs::symlink(&fx.outside, &link).unwrap();

        let result = fx.browser.read_file(&text(&link)).await;
        assert!(matches!(result, Err(ResticError::AccessDenied(_))));
    }
}
