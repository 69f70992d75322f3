//! HTTP and WebSocket surface for dashboards and door panels.

use crate::history::HistoryLog;
use crate::hub::BroadcastHub;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub history: Option<HistoryLog>,
    pub identities: Arc<Vec<String>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/history", get(history))
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.current())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": state.hub.subscriber_count(),
        "identities": state.identities.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let Some(log) = state.history else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "access history is disabled" })),
        );
    };

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    match log.recent(limit).await {
        Ok(records) => (StatusCode::OK, Json(json!(records))),
        Err(e) => {
            tracing::warn!(error = %e, "history query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.hub))
}

/// Stream status snapshots to one viewer until either side goes away.
async fn handle_websocket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = hub.subscribe();

    let mut send_task = tokio::spawn(async move {
        while let Some(status) = rx.recv().await {
            let text = match serde_json::to_string(&status) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize status");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Viewers are read-only; inbound frames only signal liveness or close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "websocket receive error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unsubscribe(&id);
}
