use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use loam_proto::Envelope;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::AuthToken;
use crate::routes::ApiError;
use crate::state::AppState;

/// WebSocket upgrade handler for controller connections. The device
/// authenticates with its own token, not the owner's.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(controller_id): Path<Uuid>,
    State(state): State<AppState>,
    token: AuthToken,
) -> Response {
    if let Err(err) = state
        .authenticate_controller(controller_id, token.as_str())
        .await
    {
        return ApiError::from(err).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, controller_id, state))
}

async fn handle_socket(socket: WebSocket, controller_id: Uuid, state: AppState) {
    let (channel_name, mut commands) = match state.connect_controller(controller_id).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(controller = %controller_id, error = %err, "connection setup failed");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Forward bus deliveries to the socket. A lagging or closed receiver ends
    // the task; the connection teardown below clears the channel id.
    let forward_controller = controller_id;
    let forward_task = tokio::spawn(async move {
        while let Ok(delivery) = commands.recv().await {
            let Ok(text) = String::from_utf8(delivery.payload.to_vec()) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(controller = %forward_controller, "command forwarder ended");
    });

    debug!(controller = %controller_id, channel = %channel_name, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                error!(controller = %controller_id, error = %err, "websocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match Envelope::decode(&text) {
                Ok(envelope) => {
                    if let Err(err) = state
                        .ingest_controller_message(controller_id, envelope)
                        .await
                    {
                        warn!(controller = %controller_id, error = %err, "failed to ingest message");
                    }
                }
                Err(err) => {
                    warn!(controller = %controller_id, error = %err, "invalid frame from controller");
                }
            },
            Message::Close(_) => {
                debug!(controller = %controller_id, "received close frame");
                break;
            }
            // Ping/Pong handled by axum, binary frames are not part of the
            // controller protocol.
            _ => {}
        }
    }

    forward_task.abort();
    state
        .disconnect_controller(controller_id, &channel_name)
        .await;
    debug!(controller = %controller_id, "websocket disconnected");
}
