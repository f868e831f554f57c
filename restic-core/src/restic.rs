//! restic 命令行适配
//!
//! 负责两件事：按操作拼出参数列表（密码只通过环境变量传递），
//! 以及解析 `snapshots --json` / `ls --json` 的输出。

use crate::config::ResticConfig;
use crate::constants::restic::COMMAND_SHELL;
use crate::database::Credential;
use crate::runner::{CollectedOutput, ProcessSpec};
use crate::{Result, ResticError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 备份来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSource {
    /// 备份本地目录
    Directory { path: String },
    /// 备份命令的标准输出，在仓库中保存为 `/<stdin_filename>`
    Command {
        command: String,
        stdin_filename: String,
    },
}

impl BackupSource {
    pub fn directory(path: impl Into<String>) -> Self {
        Self::Directory { path: path.into() }
    }

    pub fn command(command: impl Into<String>, stdin_filename: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            stdin_filename: stdin_filename.into(),
        }
    }

    /// 快照中记录的路径，成功后记入存储位置的已知路径
    pub fn target_path(&self) -> String {
        match self {
            Self::Directory { path } => path.clone(),
            Self::Command { stdin_filename, .. } => format!("/{stdin_filename}"),
        }
    }
}

/// 恢复参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub snapshot_id: String,
    pub target: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub dry_run: bool,
}

/// restic 调用参数
#[derive(Debug, Clone)]
pub struct ResticTool {
    binary: String,
    password_env: String,
}

impl ResticTool {
    pub fn new(binary: impl Into<String>, password_env: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            password_env: password_env.into(),
        }
    }

    pub fn from_config(config: &ResticConfig) -> Self {
        Self::new(&config.binary, &config.password_env)
    }

    fn spec(&self, repository: &str, credential: &Credential, args: Vec<String>) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .args(args)
            .args(["--repo", repository])
            .env(&self.password_env, credential.expose())
    }

    /// `restic init`
    pub fn init(&self, repository: &str, credential: &Credential) -> ProcessSpec {
        self.spec(repository, credential, vec!["init".to_string()])
    }

    /// `restic snapshots --json [--path P]`
    pub fn snapshots(
        &self,
        repository: &str,
        credential: &Credential,
        filter_path: Option<&str>,
    ) -> ProcessSpec {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if let Some(path) = filter_path.filter(|p| !p.is_empty()) {
            args.extend(["--path".to_string(), path.to_string()]);
        }
        self.spec(repository, credential, args)
    }

    /// `restic ls <snapshot> --json [--recursive] [dir]`，根目录时不传 dir
    pub fn ls(
        &self,
        repository: &str,
        credential: &Credential,
        snapshot_id: &str,
        directory_path: &str,
        recursive: bool,
    ) -> ProcessSpec {
        let mut args = vec!["ls".to_string(), snapshot_id.to_string(), "--json".to_string()];
        if recursive {
            args.push("--recursive".to_string());
        }
        if !directory_path.is_empty() && directory_path != "/" {
            args.push(directory_path.to_string());
        }
        self.spec(repository, credential, args)
    }

    /// `restic backup --json ...`
    pub fn backup(
        &self,
        repository: &str,
        credential: &Credential,
        source: &BackupSource,
    ) -> ProcessSpec {
        let mut args = vec!["backup".to_string(), "--json".to_string()];
        match source {
            BackupSource::Directory { path } => args.push(path.clone()),
            BackupSource::Command {
                command,
                stdin_filename,
            } => {
                args.extend([
                    "--stdin-from-command".to_string(),
                    "--stdin-filename".to_string(),
                    stdin_filename.clone(),
                ]);
                // 子命令参数必须放在最后，所以 --repo 提前
                let mut spec = self.spec(repository, credential, args);
                spec.args.extend([
                    "--".to_string(),
                    COMMAND_SHELL.to_string(),
                    "-c".to_string(),
                    command.clone(),
                ]);
                return spec;
            }
        }
        self.spec(repository, credential, args)
    }

    /// `restic restore <snapshot> --target T --verbose=2 ...`
    pub fn restore(
        &self,
        repository: &str,
        credential: &Credential,
        options: &RestoreOptions,
    ) -> ProcessSpec {
        let mut args = vec![
            "restore".to_string(),
            options.snapshot_id.clone(),
            "--target".to_string(),
            options.target.clone(),
            "--verbose=2".to_string(),
        ];
        for pattern in &options.include {
            args.extend(["--include".to_string(), pattern.clone()]);
        }
        for pattern in &options.exclude {
            args.extend(["--exclude".to_string(), pattern.clone()]);
        }
        if options.dry_run {
            args.push("--dry-run".to_string());
        }
        self.spec(repository, credential, args)
    }
}

/// 快照摘要
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub short_id: String,
    pub date: DateTime<Utc>,
    /// 备份时处理的字节数，旧版本 restic 不提供
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub paths: Vec<String>,
    pub hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    id: String,
    short_id: Option<String>,
    time: DateTime<Utc>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    summary: Option<RawSnapshotSummary>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshotSummary {
    total_bytes_processed: Option<u64>,
}

/// 解析 `restic snapshots --json` 的输出
pub fn parse_snapshots(stdout: &str) -> Result<Vec<SnapshotInfo>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawSnapshot> = serde_json::from_str(trimmed)
        .map_err(|e| ResticError::parse(format!("快照列表不是有效的 JSON: {e}")))?;

    Ok(raw
        .into_iter()
        .map(|snapshot| SnapshotInfo {
            short_id: snapshot
                .short_id
                .unwrap_or_else(|| snapshot.id.chars().take(8).collect()),
            snapshot_id: snapshot.id,
            date: snapshot.time,
            size: snapshot.summary.and_then(|s| s.total_bytes_processed),
            paths: snapshot.paths,
            hostname: snapshot.hostname,
            tags: snapshot.tags.unwrap_or_default(),
        })
        .collect())
}

/// 快照中的条目类型
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Other,
}

impl EntryType {
    fn from_restic(kind: &str) -> Self {
        match kind {
            "file" => Self::File,
            "dir" => Self::Dir,
            "symlink" => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// 快照中的一个文件或目录
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    name: Option<String>,
    #[serde(rename = "type")]
    node_type: Option<String>,
    path: Option<String>,
    size: Option<u64>,
    mode: Option<u64>,
    mtime: Option<String>,
    struct_type: Option<String>,
    message_type: Option<String>,
}

/// 解析 `restic ls --json` 的输出
///
/// 第一行是快照本身的描述，跳过；无法解析的行同样跳过。
pub fn parse_ls(stdout: &str) -> Vec<SnapshotEntry> {
    let mut entries = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let node: RawNode = match serde_json::from_str(line) {
            Ok(node) => node,
            Err(e) => {
                debug!(error = %e, "跳过无法解析的 ls 输出行");
                continue;
            }
        };

        let is_snapshot = [&node.struct_type, &node.message_type]
            .into_iter()
            .any(|kind| kind.as_deref() == Some("snapshot"));
        if is_snapshot {
            continue;
        }

        let (Some(name), Some(kind), Some(path)) = (node.name, node.node_type, node.path) else {
            continue;
        };

        entries.push(SnapshotEntry {
            name,
            entry_type: EntryType::from_restic(&kind),
            path,
            size: node.size,
            mode: node.mode,
            mtime: node
                .mtime
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        });
    }

    entries
}

/// restic 的错误输出是否表示快照不存在
pub fn is_snapshot_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no matching id") || stderr.contains("failed to find snapshot")
}

/// 根据非零退出的输出构造 [`ResticError::ToolFailure`]
pub fn tool_failure(output: &CollectedOutput) -> ResticError {
    let stderr = output.stderr_text();
    let message = if stderr.trim().is_empty() {
        output
            .exit
            .reason
            .clone()
            .unwrap_or_else(|| output.stdout_text())
    } else {
        stderr
    };

    ResticError::ToolFailure {
        code: output.exit.code,
        message: message.trim().to_string(),
    }
}
