use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
}

/// GET /v1/stream?topic=&tenant=: SSE push of work events. Lagged
/// subscribers silently skip what they missed; the pull log has it all.
pub async fn sse_events(
    State(app): State<AppState>,
    Query(q): Query<StreamQuery>,
) -> impl axum::response::IntoResponse {
    let rx = app.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let event = msg.ok()?;
        if q.topic.as_deref().is_some_and(|t| t != event.topic)
            || q.tenant.as_deref().is_some_and(|t| t != event.tenant)
        {
            return None;
        }
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default()
                .event(event.name())
                .id(format!("{}:{}", event.work_id, event.seq))
                .data(data),
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
