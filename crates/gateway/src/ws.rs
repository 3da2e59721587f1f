#![forbid(unsafe_code)]

use crate::http::AppState;
use crate::subscription::MessageSink;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound queues of the open WebSocket connections.
#[derive(Debug, Default)]
pub struct WsHub {
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<Value>>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[async_trait]
impl MessageSink for WsHub {
    async fn send(&self, connection_id: &str, message: Value) {
        let connections = self.connections.read().await;
        match connections.get(connection_id) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(connection_id, "Dropping message for closing connection");
                }
            }
            None => debug!(connection_id, "Dropping message for unknown connection"),
        }
    }
}

pub async fn subscription_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let mut outbound = state.hub.register(&connection_id).await;
    let (mut sender, mut receiver) = socket.split();
    debug!(connection_id = %connection_id, "WebSocket connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "Failed to serialize outbound message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let inbox = state.subscriptions.open_connection(&connection_id);
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => inbox.push(text),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    inbox.close().await;
    state.hub.unregister(&connection_id).await;
    state.subscriptions.disconnect(&connection_id).await;
    writer.abort();
    debug!(connection_id = %connection_id, "WebSocket disconnected");
}
