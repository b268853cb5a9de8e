//! WebSocket upgrade for the push channel.
//!
//! Authentication happens in [`super::auth::push_auth_middleware`] before the
//! upgrade; this handler only wires an admitted socket into the hub.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::AuthenticatedClient;
use super::hub::{ClientAction, Outbound, PushHub};

/// Time the send loop gets to flush after the client stops reading
const SEND_DRAIN: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<PushHub>>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Response {
    if hub.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, hub, client))
}

async fn handle_socket(socket: WebSocket, hub: Arc<PushHub>, client: AuthenticatedClient) {
    let Some((conn_id, mut rx)) = hub.register(client) else {
        debug!("Push hub refused connection during shutdown");
        return;
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if recv_hub.handle_client_message(conn_id, text.as_str()) == ClientAction::Disconnect {
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(%conn_id, "Push client closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%conn_id, error = %e, "Push socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {
            // Dropping the hub's sender lets the send loop flush and exit
            hub.unregister(conn_id);
            if tokio::time::timeout(SEND_DRAIN, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
        _ = &mut send_task => {
            recv_task.abort();
            hub.unregister(conn_id);
        }
    }

    info!(%conn_id, "Push connection closed");
}
