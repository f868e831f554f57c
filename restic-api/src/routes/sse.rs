use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use restic_core::broadcaster::EventReceiver;
use restic_core::constants::server::SSE_KEEP_ALIVE_SECS;
use std::convert::Infallible;
use std::time::Duration;
use tracing::warn;

/// 把任务事件流转换为 SSE 响应，每个事件一条 `data:` JSON
pub fn event_stream(
    receiver: EventReceiver,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = receiver.into_stream().map(|event| {
        Ok(Event::default().json_data(&event).unwrap_or_else(|e| {
            warn!(error = %e, "任务事件序列化失败");
            Event::default().comment("event serialization failed")
        }))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(SSE_KEEP_ALIVE_SECS)))
}
