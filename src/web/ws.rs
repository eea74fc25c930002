//! WebSocket handler: greets with the cached snapshot, then forwards live
//! publisher events as JSON text.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::pipeline::StreamStatus;
use crate::publish::{BroadcastPublisher, Publisher, StreamEvent};

/// Handle a single WebSocket connection.
pub async fn handle_ws(
    socket: WebSocket,
    publisher: Arc<BroadcastPublisher>,
    status: Arc<StreamStatus>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    // Subscribe before reading the snapshot so nothing published in between is lost
    let mut rx = publisher.subscribe();
    status.client_connected();
    debug!("WebSocket client connected");

    let snapshot = publisher.snapshot();
    let greeting = snapshot
        .frame
        .map(StreamEvent::Frame)
        .into_iter()
        .chain(snapshot.metadata.map(StreamEvent::CameraInfo));

    let mut open = true;
    for event in greeting {
        if !send_event(&mut ws_tx, &event).await {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => open = send_event(&mut ws_tx, &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    _ => {} // Clients have nothing to say
                }
            }
        }
    }

    status.client_disconnected();
    debug!("WebSocket client disconnected");
}

/// False once the client is gone
async fn send_event(ws_tx: &mut SplitSink<WebSocket, Message>, event: &StreamEvent) -> bool {
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.name(), e);
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}
