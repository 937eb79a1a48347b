//! `GET /events`: server-sent events fed by the core event bus.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::state::AppState;

pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.bus.subscribe().await;
    let stream = ReceiverStream::new(subscription.rx).filter_map(|event| {
        if matches!(event, ding_core::event::Event::Keepalive) {
            return None;
        }
        let kind = event_kind(&event);
        serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(SseEvent::default().event(kind).data(data)))
    });

    // The bus already emits its own 120-second keepalive comment lines via
    // Event::Keepalive on every subscriber; axum's KeepAlive is kept short
    // only as a transport-level backstop against idle proxies.
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(120)).text("keepalive"))
}

fn event_kind(event: &ding_core::event::Event) -> &'static str {
    use ding_core::event::Event;
    match event {
        Event::Repo(_) => "repo",
        Event::RemoveRepo { .. } => "removeRepo",
        Event::Build { .. } => "build",
        Event::RemoveBuild { .. } => "removeBuild",
        Event::Output { .. } => "output",
        Event::Keepalive => "keepalive",
    }
}
