//! Recipient websocket endpoint.
//!
//! A connection identifies its recipient via the `recipient_id` query
//! parameter and stays open for pushed notification frames. The outbound
//! leg drains the session queue; the inbound leg only watches for close.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::api::error::ApiError;
use crate::dispatch::DispatchService;

/// Query parameters for the websocket connection.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub recipient_id: String,
}

pub async fn notification_ws(
    ws: WebSocketUpgrade,
    State(service): State<Arc<DispatchService>>,
    Query(params): Query<WsParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.recipient_id.trim().is_empty() {
        return Err(ApiError::bad_request("recipient_id must not be empty"));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, service, params.recipient_id)))
}

async fn handle_socket(socket: WebSocket, service: Arc<DispatchService>, recipient_id: String) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut frames = service.on_connect(&recipient_id, &connection_id);
    debug!(recipient_id = %recipient_id, connection_id = %connection_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Session was unregistered out from under us.
                    None => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    // Clients have nothing else to say on this socket.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    service.on_disconnect(&connection_id);
    let _ = sender.close().await;
    debug!(connection_id = %connection_id, "websocket disconnected");
}
