//! 任务事件通道
//!
//! 单生产者、单消费者。发送方从不阻塞：缓冲区满时丢弃最早的中间事件，
//! 开始事件和终止事件永远不会被丢弃。接收方断开后发送方照常工作，任务不受影响。

use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// 任务结束信息
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobCompletion {
    /// 恒为 true，便于客户端识别终止事件
    pub completed: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub log_id: String,
    /// 恢复成功后浏览恢复内容的地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browse_link: Option<String>,
}

impl JobCompletion {
    pub fn new(
        success: bool,
        snapshot_id: Option<String>,
        reason: Option<String>,
        log_id: impl Into<String>,
    ) -> Self {
        Self {
            completed: true,
            success,
            snapshot_id,
            reason,
            log_id: log_id.into(),
            browse_link: None,
        }
    }

    pub fn with_browse_link(mut self, browse_link: Option<String>) -> Self {
        self.browse_link = browse_link;
        self
    }
}

/// 恢复进度
///
/// 已知文件总数时携带百分比；否则只有已处理数量和提示信息。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RestoreProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    pub processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 任务事件
///
/// 序列化为无标签 JSON：`{"message", "job_id"}`、`{"message"}`、`{"output"}`、
/// `{"progress", "processed", "total"}` 或 `{"completed": true, ...}`。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum JobEvent {
    Started { message: String, job_id: String },
    Message { message: String },
    Output { output: String },
    Progress(RestoreProgress),
    Completed(JobCompletion),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// 缓冲区满时可以丢弃的事件
    fn is_droppable(&self) -> bool {
        !matches!(self, Self::Started { .. } | Self::Completed(_))
    }

    pub fn completion(&self) -> Option<&JobCompletion> {
        match self {
            Self::Completed(completion) => Some(completion),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct State {
    queue: VecDeque<JobEvent>,
    sender_closed: bool,
    receiver_closed: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 创建一对事件收发端
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            sender_closed: false,
            receiver_closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });

    (
        EventSender {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// 事件发送端
#[derive(Debug)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// 发送事件，返回接收方是否仍在
    pub fn send(&self, event: JobEvent) -> bool {
        let mut state = self.shared.lock();
        if state.receiver_closed {
            return false;
        }

        if state.queue.len() >= self.shared.capacity {
            if let Some(index) = state.queue.iter().position(JobEvent::is_droppable) {
                state.queue.remove(index);
                state.dropped += 1;
                warn!(
                    dropped = state.dropped,
                    capacity = self.shared.capacity,
                    "事件缓冲区已满，丢弃最早的事件"
                );
            }
        }

        state.queue.push_back(event);
        drop(state);
        self.shared.notify.notify_one();
        true
    }

    /// 接收方是否已断开
    pub fn is_closed(&self) -> bool {
        self.shared.lock().receiver_closed
    }

    /// 已丢弃的事件数量
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        self.shared.lock().sender_closed = true;
        self.shared.notify.notify_one();
    }
}

/// 事件接收端
#[derive(Debug)]
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// 读取下一个事件；发送端关闭且缓冲区为空时返回 None
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.sender_closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// 读取到终止事件为止，返回终止事件（用于不需要中间输出的调用方）
    pub async fn wait_for_completion(mut self) -> Option<JobCompletion> {
        while let Some(event) = self.recv().await {
            if let JobEvent::Completed(completion) = event {
                return Some(completion);
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.receiver_closed = true;
        state.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn output(line: &str) -> JobEvent {
        JobEvent::Output {
            output: line.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_in_order_then_end() {
        let (sender, mut receiver) = event_channel(16);
        sender.send(JobEvent::Started {
            message: "开始备份".to_string(),
            job_id: "job-1".to_string(),
        });
        sender.send(output("a"));
        sender.send(JobEvent::Completed(JobCompletion::new(true, None, None, "job-1")));
        drop(sender);

        assert!(matches!(receiver.recv().await, Some(JobEvent::Started { .. })));
        assert_eq!(receiver.recv().await, Some(output("a")));
        assert!(receiver.recv().await.unwrap().is_terminal());
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_but_keeps_terminal() {
        let (sender, receiver) = event_channel(3);
        for i in 0..5 {
            sender.send(output(&i.to_string()));
        }
        sender.send(JobEvent::Completed(JobCompletion::new(false, None, None, "job-1")));
        assert_eq!(sender.dropped(), 3);
        drop(sender);

        let events: Vec<_> = receiver.into_stream().collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], output("3"));
        assert_eq!(events[1], output("4"));
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_overflow_keeps_started_event() {
        let (sender, receiver) = event_channel(3);
        sender.send(JobEvent::Started {
            message: "开始恢复".to_string(),
            job_id: "job-1".to_string(),
        });
        for i in 0..5 {
            sender.send(output(&i.to_string()));
        }
        sender.send(JobEvent::Completed(JobCompletion::new(true, None, None, "job-1")));
        assert_eq!(sender.dropped(), 4);
        drop(sender);

        let events: Vec<_> = receiver.into_stream().collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], JobEvent::Started { .. }));
        assert_eq!(events[1], output("4"));
        assert!(events[2].is_terminal());
    }

    #[tokio::test]
    async fn test_receiver_waits_for_sender() {
        let (sender, receiver) = event_channel(8);
        let consumer = tokio::spawn(receiver.wait_for_completion());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sender.send(output("x"));
        sender.send(JobEvent::Completed(JobCompletion::new(
            true,
            Some("deadbeef".to_string()),
            None,
            "deadbeef",
        )));

        let completion = consumer.await.unwrap().unwrap();
        assert!(completion.success);
        assert_eq!(completion.snapshot_id.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_block_sender() {
        let (sender, receiver) = event_channel(1);
        drop(receiver);
        assert!(sender.is_closed());
        for i in 0..10 {
            assert!(!sender.send(output(&i.to_string())));
        }
    }

    #[test]
    fn test_wire_format() {
        let started = JobEvent::Started {
            message: "开始备份".to_string(),
            job_id: "job-1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            serde_json::json!({"message": "开始备份", "job_id": "job-1"})
        );

        let done = JobEvent::Completed(JobCompletion::new(
            false,
            None,
            Some("parse-failure".to_string()),
            "job-1",
        ));
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            serde_json::json!({
                "completed": true,
                "success": false,
                "reason": "parse-failure",
                "log_id": "job-1"
            })
        );

        let progress = JobEvent::Progress(RestoreProgress {
            progress: Some(25),
            processed: 5,
            total: Some(20),
            message: None,
        });
        assert_eq!(
            serde_json::to_value(&progress).unwrap(),
            serde_json::json!({"progress": 25, "processed": 5, "total": 20})
        );

        let restored = JobEvent::Completed(
            JobCompletion::new(true, None, None, "job-2")
                .with_browse_link(Some("/browse/srv/out".to_string())),
        );
        assert_eq!(
            serde_json::to_value(&restored).unwrap()["browse_link"],
            "/browse/srv/out"
        );
    }
}
