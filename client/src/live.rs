use std::time::Duration;

use futures::StreamExt;
use gridclaim_shared::{LiveEvent, RawCell};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{LIVE_RECONNECT_BASE_MS, LIVE_RECONNECT_MAX_MS};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser. Feed it arbitrary byte chunks;
/// complete frames come out once their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseFrame,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let frame = std::mem::take(&mut self.current);
            let dispatch = std::mem::take(&mut self.has_data);
            return dispatch.then_some(frame);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = value.to_string(),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.current.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Decode a frame into a live event. Accepts the tagged event envelope as
/// well as bare cell payloads keyed only by the event name.
pub fn decode_frame(frame: &SseFrame) -> Option<LiveEvent> {
    if let Ok(event) = serde_json::from_str::<LiveEvent>(&frame.data) {
        return Some(event);
    }
    let seq = frame
        .id
        .as_deref()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);
    match frame.event.as_str() {
        "cell" => serde_json::from_str::<RawCell>(&frame.data)
            .ok()
            .map(|cell| LiveEvent::Cell { seq, cell }),
        "cells" => serde_json::from_str::<Vec<RawCell>>(&frame.data)
            .ok()
            .map(|cells| LiveEvent::Cells { seq, cells }),
        "resync" => Some(LiveEvent::Resync { seq }),
        _ => None,
    }
}

fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(6);
    let ms = (LIVE_RECONNECT_BASE_MS * (1u64 << exponent)).min(LIVE_RECONNECT_MAX_MS);
    Duration::from_millis(ms)
}

enum StreamEnd {
    /// The engine dropped its receiver.
    Closed,
    Disconnected(String),
}

/// Subscribe to `/api/events` and forward every decoded event into the
/// engine's bounded live channel, reconnecting with backoff. After a
/// reconnect a `resync` is forwarded since events may have been missed.
/// Returns when the engine side of the channel closes.
pub async fn run_live_feed(client: reqwest::Client, base_url: String, tx: mpsc::Sender<LiveEvent>) {
    let url = format!("{base_url}/api/events");
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        match stream_once(&client, &url, &tx, connected_before).await {
            Ok(StreamEnd::Closed) => {
                debug!("live channel closed, stopping feed");
                return;
            }
            Ok(StreamEnd::Disconnected(reason)) => {
                connected_before = true;
                failures = 1;
                warn!(reason = %reason, "live event stream ended");
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!(error = %e, attempt = failures, "live event stream connect failed");
            }
        }
        if tx.is_closed() {
            return;
        }
        let backoff = reconnect_backoff(failures);
        debug!(backoff_ms = backoff.as_millis() as u64, "reconnecting live stream");
        tokio::time::sleep(backoff).await;
    }
}

async fn stream_once(
    client: &reqwest::Client,
    url: &str,
    tx: &mpsc::Sender<LiveEvent>,
    resync_on_connect: bool,
) -> Result<StreamEnd, reqwest::Error> {
    let resp = client
        .get(url)
        .header("accept", "text/event-stream")
        .send()
        .await?
        .error_for_status()?;
    info!(url, "live event stream connected");

    if resync_on_connect && tx.send(LiveEvent::Resync { seq: 0 }).await.is_err() {
        return Ok(StreamEnd::Closed);
    }

    let mut parser = SseParser::new();
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Ok(StreamEnd::Disconnected(e.to_string())),
        };
        for frame in parser.feed(&chunk) {
            let Some(event) = decode_frame(&frame) else {
                debug!(event = %frame.event, "ignoring undecodable live frame");
                continue;
            };
            if tx.send(event).await.is_err() {
                return Ok(StreamEnd::Closed);
            }
        }
    }
    Ok(StreamEnd::Disconnected("server closed the stream".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::spawn;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parser_handles_split_chunks_and_comments() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b":keep-alive\n\nevent: ce").is_empty());
        let frames = parser.feed(b"ll\r\nid: 7\r\ndata: {\"x\":0,\r\ndata: \"y\":20}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "cell");
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].data, "{\"x\":0,\n\"y\":20}");
    }

    #[test]
    fn decodes_tagged_and_bare_payloads() {
        let tagged = SseFrame {
            event: "cells".into(),
            data: r#"{"type":"cells","seq":3,"cells":[{"x":0,"y":0}]}"#.into(),
            id: None,
        };
        match decode_frame(&tagged) {
            Some(LiveEvent::Cells { seq, cells }) => {
                assert_eq!(seq, 3);
                assert_eq!(cells.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        let bare = SseFrame {
            event: "cell".into(),
            data: r#"{"x":"40","y":20,"idol_group_name":"X"}"#.into(),
            id: Some("9".into()),
        };
        match decode_frame(&bare) {
            Some(LiveEvent::Cell { seq, cell }) => {
                assert_eq!(seq, 9);
                assert_eq!(cell.x, Value::from("40"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let resync = SseFrame {
            event: "resync".into(),
            data: "{}".into(),
            id: None,
        };
        assert!(matches!(decode_frame(&resync), Some(LiveEvent::Resync { .. })));

        let junk = SseFrame {
            event: "other".into(),
            data: "nope".into(),
            id: None,
        };
        assert!(decode_frame(&junk).is_none());
    }

    #[test]
    fn reconnect_backoff_caps() {
        assert_eq!(reconnect_backoff(1), Duration::from_millis(500));
        assert_eq!(reconnect_backoff(3), Duration::from_millis(2000));
        assert_eq!(reconnect_backoff(20), Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn reconnect_forwards_resync_before_new_events() {
        // every connection sends one cell and then closes the stream
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let router = Router::new().route(
            "/api/events",
            get(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let body = format!(
                        "event: cell\nid: {n}\ndata: {{\"x\":{x},\"y\":0}}\n\n",
                        x = n * 20
                    );
                    ([(header::CONTENT_TYPE, "text/event-stream")], body)
                }
            }),
        );
        let base_url = spawn(router).await;
        let (tx, mut rx) = mpsc::channel(16);
        let feed = tokio::spawn(run_live_feed(reqwest::Client::new(), base_url, tx));

        let mut received = Vec::new();
        let collected = tokio::time::timeout(Duration::from_secs(5), async {
            while received.len() < 3 {
                match rx.recv().await {
                    Some(event) => received.push(event),
                    None => break,
                }
            }
        })
        .await;
        feed.abort();
        assert!(collected.is_ok(), "timed out, got {received:?}");

        assert!(matches!(received[0], LiveEvent::Cell { seq: 1, .. }), "{received:?}");
        assert!(matches!(received[1], LiveEvent::Resync { .. }), "{received:?}");
        match &received[2] {
            LiveEvent::Cell { seq, cell } => {
                assert_eq!(*seq, 2);
                assert_eq!(cell.x, Value::from(40));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(connections.load(Ordering::SeqCst) >= 2);
    }
}
