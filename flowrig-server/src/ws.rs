use crate::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use flowrig_core::bus::EventBus;
use serde_json::json;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

/// `GET /ws`: upgrade and stream every bus event to the client as one
/// JSON object per message.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let connections = state.ws_connections.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(connections, "websocket connected");

    // Bus handlers must never block on a slow client: events are pushed
    // through a bounded channel and dropped with a warning when it fills.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let subscription = state.bus.subscribe_all(EventBus::handler(move |event| {
        let tx = tx.clone();
        async move {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if tx.try_send(payload).is_err() {
                        tracing::warn!("websocket client lagging, dropping event");
                    }
                }
                Err(err) => tracing::error!(%err, "failed to serialize event"),
            }
        }
    }));

    let greeting = json!({
        "type": "connected",
        "message": "Connected to FlowRig",
        "connections": connections,
    });
    if socket.send(Message::Text(greeting.to_string())).await.is_err() {
        finish(&state, subscription);
        return;
    }

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Inbound frames (pings, stray text) are ignored; the
                // stream is one-directional.
                Some(Ok(_)) => {}
            },
        }
    }

    finish(&state, subscription);
}

fn finish(state: &AppState, subscription: flowrig_core::bus::SubscriptionId) {
    state.bus.unsubscribe(subscription);
    let connections = state.ws_connections.fetch_sub(1, Ordering::SeqCst) - 1;
    tracing::info!(connections, "websocket disconnected");
}
