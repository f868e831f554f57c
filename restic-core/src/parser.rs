//! restic 备份输出解析
//!
//! `restic backup --json` 每行输出一个 JSON 对象，最后一行结果行的
//! `message_type` 为 `summary`，其中的 `snapshot_id` 即新快照ID。

use crate::constants::restic::SUMMARY_MESSAGE_TYPE;
use crate::{Result, ResticError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static SNAPSHOT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{8,64}$").unwrap());

#[derive(Debug, Deserialize)]
struct MessageLine {
    message_type: Option<String>,
    snapshot_id: Option<String>,
}

/// 快照ID是否为合法的十六进制ID（8 到 64 位）
pub fn is_valid_snapshot_id(id: &str) -> bool {
    SNAPSHOT_ID_RE.is_match(id)
}

/// 从备份输出中提取新快照ID
///
/// 只认最后一条 summary 行；没有 summary 行，或 summary 行中缺少合法ID，
/// 都返回 [`ResticError::Parse`]。
pub fn extract_snapshot_id<I, S>(lines: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut summary: Option<MessageLine> = None;

    for line in lines {
        let line = line.as_ref().trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(message) = serde_json::from_str::<MessageLine>(line) else {
            continue;
        };
        if message.message_type.as_deref() == Some(SUMMARY_MESSAGE_TYPE) {
            summary = Some(message);
        }
    }

    let summary = summary.ok_or_else(|| ResticError::parse("输出中没有 summary 行"))?;
    match summary.snapshot_id {
        Some(id) if is_valid_snapshot_id(&id) => Ok(id),
        Some(id) => Err(ResticError::parse(format!("无效的快照ID: {id}"))),
        None => Err(ResticError::parse("summary 行缺少 snapshot_id")),
    }
}
