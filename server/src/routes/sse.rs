use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use futures::stream::Stream;
use gridclaim_shared::LiveEvent;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::config::SSE_KEEPALIVE_SECS;
use crate::state::{AppState, PreSerializedEvent};

/// One outgoing SSE frame: event name, id and JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    name: &'static str,
    seq: u64,
    data: String,
}

impl Frame {
    fn into_event(self) -> Event {
        Event::default()
            .id(self.seq.to_string())
            .event(self.name)
            .data(self.data)
    }
}

pub async fn cell_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before the response is returned so nothing published after
    // the client sees the headers is missed.
    let rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        let mut stream = BroadcastStream::new(rx);
        while let Some(result) = stream.next().await {
            if let Some(frame) = frame_for(result, state.current_seq()) {
                yield Ok(frame.into_event());
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keep-alive"),
    )
}

/// A lagged subscriber gets a `resync` frame in place of the events it
/// missed, telling it to refetch everything it has loaded.
fn frame_for(
    result: Result<PreSerializedEvent, BroadcastStreamRecvError>,
    current_seq: u64,
) -> Option<Frame> {
    match result {
        Ok(event) => {
            let Ok(data) = std::str::from_utf8(event.json.as_ref()) else {
                warn!(
                    seq = event.seq,
                    event = event.name,
                    "event payload is not valid utf-8; dropping SSE event"
                );
                return None;
            };
            Some(Frame {
                name: event.name,
                seq: event.seq,
                data: data.to_string(),
            })
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(
                skipped_events = skipped,
                "SSE client lagged behind broadcast buffer; sending resync"
            );
            let resync = LiveEvent::Resync { seq: current_seq };
            match serde_json::to_string(&resync) {
                Ok(data) => Some(Frame {
                    name: resync.event_name(),
                    seq: current_seq,
                    data,
                }),
                Err(e) => {
                    warn!(error = %e, "failed to serialize resync event");
                    None
                }
            }
        }
    }
}
