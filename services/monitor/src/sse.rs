use crate::control_api::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

/// Stream of [`MonitorUiEvent`](crate::ui_events::MonitorUiEvent)s. A lagged
/// client gets a `resync` event and should re-read `/api/v1/state`.
pub async fn monitor_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.monitor.subscribe_ui();
    let updates = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().event(event.name()).data(json))),
        Err(_) => Some(Ok(Event::default().event("resync").data("{}"))),
    });
    let initial = tokio_stream::once(Ok(Event::default().event("connected").data("{}")));

    Sse::new(initial.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
