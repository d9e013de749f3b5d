use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

/// GET /api/runs/events: SSE stream with one `run` event per state change.
///
/// Slow consumers that lag behind the channel silently skip events.
pub async fn run_events(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.dispatcher.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok()
            .and_then(|event| Event::default().event("run").json_data(&event).ok())
            .map(Ok::<Event, Infallible>)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
