//! 外部进程执行器
//!
//! 启动一个外部命令，将 stdout/stderr 按行合并成事件序列，
//! 最后以且仅以一个 [`ProcessEvent::Exited`] 结束。子进程由监督任务持有，
//! 无论正常退出、超时还是读取方提前放弃，都会被回收。

use crate::constants::job::{
    PIPE_DRAIN_GRACE_SECS, SIGNAL_EXIT_BASE, TIMEOUT_EXIT_CODE, UNKNOWN_EXIT_CODE,
};
use crate::{Result, ResticError};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 输出来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// 进程退出信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    /// 非正常结束（超时、被信号终止）时的原因
    pub reason: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// 进程事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: OutputStream, line: String },
    Exited(ProcessExit),
}

/// 待启动的命令
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// 进程句柄：惰性、有限、不可重放的事件序列
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 读取下一个事件，`Exited` 之后返回 None
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// 读完全部输出，用于不需要流式处理的短命令
    pub async fn collect(mut self) -> CollectedOutput {
        let mut collected = CollectedOutput::default();
        while let Some(event) = self.next_event().await {
            match event {
                ProcessEvent::Output {
                    stream: OutputStream::Stdout,
                    line,
                } => collected.stdout.push(line),
                ProcessEvent::Output {
                    stream: OutputStream::Stderr,
                    line,
                } => collected.stderr.push(line),
                ProcessEvent::Exited(exit) => collected.exit = exit,
            }
        }
        collected
    }
}

/// 一次性收集的进程输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: ProcessExit,
}

impl Default for CollectedOutput {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: ProcessExit {
                code: UNKNOWN_EXIT_CODE,
                reason: Some("进程事件流提前结束".to_string()),
            },
        }
    }
}

impl CollectedOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// 外部进程执行器
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// 启动进程。可执行文件不存在或无法执行时立即返回 [`ResticError::Spawn`]
    pub fn start(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let program = which::which(&spec.program)
            .map_err(|e| ResticError::spawn(format!("{}: {e}", spec.program)))?;

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ResticError::spawn(format!("{}: {e}", program.display())))?;
        let pid = child.id();
        debug!(pid = ?pid, program = %program.display(), args = ?spec.args, "进程已启动");

        let (sender, events) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                sender.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                sender.clone(),
            )));
        }

        tokio::spawn(supervise(child, readers, sender, self.timeout));

        Ok(ProcessHandle { pid, events })
    }
}

/// 按行转发输出；末尾没有换行符的残留内容在流关闭时也会发出
async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    sender: mpsc::UnboundedSender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                // 读取方已放弃时继续读完管道，避免子进程因管道写满而阻塞
                let _ = sender.send(ProcessEvent::Output { stream, line });
            }
            Err(e) => {
                warn!(error = %e, ?stream, "读取进程输出失败");
                break;
            }
        }
    }
}

/// 等待进程结束（必要时超时终止），收尾输出后发送唯一的退出事件
async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    sender: mpsc::UnboundedSender<ProcessEvent>,
    timeout: Option<Duration>,
) {
    let pid = child.id();
    let exit = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => exit_from_status(status),
            Err(_) => {
                warn!(pid = ?pid, timeout_secs = limit.as_secs(), "进程超时，正在终止");
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "终止超时进程失败");
                }
                ProcessExit {
                    code: TIMEOUT_EXIT_CODE,
                    reason: Some(format!("进程超时 ({} 秒) 被终止", limit.as_secs())),
                }
            }
        },
        None => exit_from_status(child.wait().await),
    };

    // 孙进程可能继续占用管道，只等待有限时间
    let grace = Duration::from_secs(PIPE_DRAIN_GRACE_SECS);
    for mut reader in readers {
        if tokio::time::timeout(grace, &mut reader).await.is_err() {
            warn!(pid = ?pid, "进程输出管道未关闭，放弃剩余输出");
            reader.abort();
        }
    }

    debug!(pid = ?pid, code = exit.code, "进程已退出");
    let _ = sender.send(ProcessEvent::Exited(exit));
}

fn exit_from_status(status: std::io::Result<ExitStatus>) -> ProcessExit {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return ProcessExit {
                code: UNKNOWN_EXIT_CODE,
                reason: Some(format!("等待进程退出失败: {e}")),
            };
        }
    };

    if let Some(code) = status.code() {
        return ProcessExit { code, reason: None };
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessExit {
                code: SIGNAL_EXIT_BASE + signal,
                reason: Some(format!("进程被信号 {signal} 终止")),
            };
        }
    }

    ProcessExit {
        code: UNKNOWN_EXIT_CODE,
        reason: Some("进程异常退出".to_string()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_output_then_single_exit() {
        let runner = ProcessRunner::default();
        let mut handle = runner
            .start(sh("echo one; echo two; printf three; exit 3"))
            .unwrap();

        let mut lines = Vec::new();
        let mut exits = Vec::new();
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Output { line, .. } => {
                    assert!(exits.is_empty(), "退出事件之后不应再有输出");
                    lines.push(line);
                }
                ProcessEvent::Exited(exit) => exits.push(exit),
            }
        }

        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].code, 3);
        assert!(exits[0].reason.is_none());
    }

    #[tokio::test]
    async fn test_stderr_and_env() {
        let runner = ProcessRunner::default();
        let output = runner
            .start(sh("echo \"pw=$SECRET_VALUE\"; echo oops >&2").env("SECRET_VALUE", "xyz"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(output.stdout, vec!["pw=xyz"]);
        assert_eq!(output.stderr, vec!["oops"]);
        assert!(output.exit.success());
    }

    #[tokio::test]
    async fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let output = ProcessRunner::default()
            .start(sh("pwd").cwd(dir.path()))
            .unwrap()
            .collect()
            .await;

        let expected = dir.path().canonicalize().unwrap();
        let actual = std::path::Path::new(&output.stdout[0]).canonicalize().unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let runner = ProcessRunner::default();
        let result = runner.start(ProcessSpec::new("definitely-not-a-real-binary-42"));
        assert!(matches!(result, Err(ResticError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(200)));
        let output = runner
            .start(sh("echo started; exec sleep 30"))
            .unwrap()
            .collect()
            .await;

        assert_eq!(output.stdout, vec!["started"]);
        assert_eq!(output.exit.code, TIMEOUT_EXIT_CODE);
        assert!(output.exit.reason.is_some());
    }

    #[tokio::test]
    async fn test_dropped_handle_still_reaps() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let script = format!("sleep 0.2; touch {}", marker.display());

        let handle = ProcessRunner::default().start(sh(&script)).unwrap();
        drop(handle);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(marker.exists());
    }
}
