//! WebSocket event stream
//!
//! Each connection subscribes to the bus and receives every event as a
//! JSON object with a `type` discriminator. A client that stops reading
//! lags the broadcast buffer and observes an `overflow` marker; a client
//! whose send fails is dropped, which unsubscribes it.

use crate::server::GatewayState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.bus.subscribe();
    info!("event subscriber connected");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("event subscriber disconnected");
                        return;
                    }
                    Some(Ok(_)) => {} // inbound content is ignored
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        return;
                    }
                }
            }

            event = events.next() => {
                let Some(event) = event else {
                    debug!("event bus closed");
                    return;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                            // dead subscriber; dropping the stream unsubscribes
                            info!("event subscriber send failed, cleaning up");
                            return;
                        }
                    }
                    Err(e) => warn!("event serialization failed: {}", e),
                }
            }
        }
    }
}
