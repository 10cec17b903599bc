use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Extension, Path, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::{future, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::auth;
use crate::models::permissions::ROOMS_RESOURCE;
use crate::models::Permissions;
use crate::ws;
use crate::AppState;

/// WebSocket handler for `/yjs/*room`
pub async fn websocket_handler(
    Path(room): Path<String>,
    State(state): State<AppState>,
    Extension(permissions): Extension<Permissions>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // Refuse callers without room access before looking at the upgrade itself.
    if let Err(denied) = auth::ensure_permission(&permissions, ROOMS_RESOURCE, "read") {
        info!("Refusing connection to room {}: no room access", room);
        return denied.into_response();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    info!("New WebSocket connection attempt for room {}", room);
    upgrade.on_upgrade(move |socket| handle_socket(socket, room, state, permissions))
}

/// Bridge a websocket to the room protocol, which works on raw binary frames.
async fn handle_socket(socket: WebSocket, room: String, state: AppState, permissions: Permissions) {
    let (mut sender, receiver) = socket.split();
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();

    // Frames for this client are queued by the room and written here, so a
    // slow socket never holds up delivery to the others.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if sender.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Text, ping and pong frames carry nothing for the room protocol.
    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(data),
                _ => None,
            })
        })
        .boxed();

    let mut recv_task = tokio::spawn(ws::serve(state.hub.clone(), room.clone(), permissions, outbox, inbound));

    // Either side finishing ends the connection.
    tokio::select! {
        _ = (&mut recv_task) => {
            // Let queued frames drain; the writer stops once the room has let go of the outbox.
            let _ = send_task.await;
        }
        _ = (&mut send_task) => recv_task.abort(),
    };
    debug!("WebSocket connection for room {} terminated", room);
}
