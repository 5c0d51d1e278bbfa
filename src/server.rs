use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::auth::Claims;
use crate::messages::{ClientMessage, ServerMessage};
use crate::room::Participant;
use crate::App;

/// Drive one authenticated websocket until it closes. Outbound messages go
/// through an unbounded queue drained by a writer task; the reader loop
/// handles client events one at a time.
pub async fn handle_connection(app: App, ws: WebSocket, claims: Claims) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let display_name = app
        .store
        .account(&claims.sub)
        .await
        .map_or_else(|| claims.sub.clone(), |account| account.name);
    app.hub
        .register(&connection_id, Participant::new(claims.sub.clone(), display_name, tx.clone()))
        .await;
    info!("Connection {connection_id} opened for {}", claims.sub);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode outbound message: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::text(text)).await {
                debug!("Failed to send WebSocket message: {e}");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let _ = tx.send(ServerMessage::Connected { connection_id: connection_id.clone() });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("WebSocket error on {connection_id}: {e}");
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        let Ok(text) = msg.to_str() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(client_msg) => handle_client_message(&app, client_msg, &connection_id, &claims, &tx).await,
            Err(e) => {
                let _ = tx.send(ServerMessage::Error { message: format!("Malformed message: {e}") });
            }
        }
    }

    handle_disconnect(&app, &connection_id).await;
    drop(tx);
    let _ = writer.await;
}

async fn handle_client_message(
    app: &App,
    message: ClientMessage,
    connection_id: &str,
    claims: &Claims,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let outcome = match message {
        ClientMessage::JoinRoom { alert_id } => app.chat.join_room(&alert_id, connection_id, claims).await,
        ClientMessage::LeaveRoom { alert_id } => {
            app.chat.leave_room(&alert_id, connection_id).await;
            Ok(())
        }
        ClientMessage::SendMessage { alert_id, message } => app
            .chat
            .send_message(&alert_id, connection_id, &message)
            .await
            .map(|_| ()),
        ClientMessage::Typing { alert_id } => app.chat.typing(&alert_id, connection_id).await.map(|_| ()),
    };

    if let Err(e) = outcome {
        debug!("Rejected event from {connection_id}: {e}");
        let _ = tx.send(ServerMessage::Error { message: e.to_string() });
    }
}

async fn handle_disconnect(app: &App, connection_id: &str) {
    app.hub.unregister(connection_id).await;
    info!("Connection {connection_id} closed");
}
