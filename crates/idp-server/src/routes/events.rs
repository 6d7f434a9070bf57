use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;

use idp_engine::WorkflowEvent;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    /// Only forward events for this workflow id.
    pub workflow: Option<String>,
}

impl EventQuery {
    fn wants(&self, event: &WorkflowEvent) -> bool {
        self.workflow
            .as_deref()
            .is_none_or(|id| id == event.workflow_id())
    }
}

/// GET /api/events — SSE stream; the event name is the `WorkflowEvent` type.
pub async fn sse_events(
    State(app): State<AppState>,
    Query(q): Query<EventQuery>,
) -> impl IntoResponse {
    let rx = app.service.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let event = msg.ok().filter(|ev| q.wants(ev)).and_then(|ev| {
            Event::default().event(ev.name()).json_data(&ev).ok()
        });
        futures::future::ready(event.map(Ok::<Event, Infallible>))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/ws — the same events as JSON text frames.
pub async fn ws_events(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    Query(q): Query<EventQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_events(socket, app, q))
}

async fn push_events(socket: WebSocket, app: AppState, q: EventQuery) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut rx = app.service.subscribe();
    tracing::debug!(workflow = ?q.workflow, "event websocket connected");

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            event = rx.recv() => match event {
                Ok(ev) if q.wants(&ev) => {
                    let Ok(text) = serde_json::to_string(&ev) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event websocket lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("event websocket closed");
}
