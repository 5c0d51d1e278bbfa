use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::auth::Claims;
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::messages::ServerMessage;
use crate::models::{Alert, ChatMessage, ChatMessageView};
use crate::room::ChatHub;
use crate::store::Store;

/// How long receivers show a typing indicator without a follow-up signal.
pub const TYPING_EXPIRY_MS: u64 = 2000;

/// Chat scoped to one alert: live fan-out through the hub plus durable
/// history in the store. Only the alert's participants get in.
pub struct ChatService {
    store: Arc<Store>,
    hub: ChatHub,
    clock: Arc<dyn Clock>,
}

impl ChatService {
    pub fn new(store: Arc<Store>, hub: ChatHub, clock: Arc<dyn Clock>) -> Self {
        Self { store, hub, clock }
    }

    /// Admins, the reporter and the assigned responder are participants.
    pub async fn authorize(&self, alert_id: &str, caller: &Claims) -> Result<Alert> {
        let alert = self.store.any_alert(alert_id).await?;
        if caller.is_admin() || alert.is_owned_by(&caller.sub) || alert.is_assigned_to(&caller.sub) {
            Ok(alert)
        } else {
            Err(AppError::forbidden("Not a participant of this alert"))
        }
    }

    pub async fn join_room(&self, alert_id: &str, connection_id: &str, caller: &Claims) -> Result<()> {
        self.authorize(alert_id, caller).await?;
        self.hub.join(alert_id, connection_id).await;
        self.hub
            .send_to(connection_id, ServerMessage::RoomJoined { alert_id: alert_id.to_string() })
            .await;
        info!("{} joined chat of alert {alert_id}", caller.sub);
        Ok(())
    }

    pub async fn leave_room(&self, alert_id: &str, connection_id: &str) -> bool {
        let left = self.hub.leave(alert_id, connection_id).await;
        if left {
            debug!("Connection {connection_id} left chat of alert {alert_id}");
        }
        left
    }

    /// Persist, then broadcast to the whole room including the sender. The
    /// sender is whoever owns the connection.
    pub async fn send_message(&self, alert_id: &str, connection_id: &str, text: &str) -> Result<ChatMessage> {
        let participant = self
            .hub
            .participant(connection_id)
            .await
            .ok_or_else(|| AppError::unauthorized("Unknown connection"))?;
        if !self.hub.is_member(alert_id, connection_id).await {
            return Err(AppError::forbidden("Join the room before sending messages"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::validation("Message cannot be empty"));
        }
        self.store.any_alert(alert_id).await?;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            alert_id: alert_id.to_string(),
            sender_id: participant.account_id.clone(),
            message: text.to_string(),
            created_at: self.clock.now(),
        };
        self.store.insert_message(message.clone()).await?;

        let delivered = self
            .hub
            .broadcast(
                alert_id,
                ServerMessage::ReceiveMessage {
                    sender: participant.display_name,
                    message: message.message.clone(),
                    timestamp: message.created_at,
                },
            )
            .await;
        debug!("Message {} in {alert_id} delivered to {delivered} connection(s)", message.id);
        Ok(message)
    }

    pub async fn typing(&self, alert_id: &str, connection_id: &str) -> Result<usize> {
        let participant = self
            .hub
            .participant(connection_id)
            .await
            .ok_or_else(|| AppError::unauthorized("Unknown connection"))?;
        if !self.hub.is_member(alert_id, connection_id).await {
            return Err(AppError::forbidden("Join the room before sending messages"));
        }
        let signal = ServerMessage::Typing {
            sender: participant.display_name,
            expires_in_ms: TYPING_EXPIRY_MS,
        };
        Ok(self.hub.broadcast_except(alert_id, signal, Some(connection_id)).await)
    }

    /// Stored messages oldest first, senders resolved.
    pub async fn history(&self, alert_id: &str, caller: &Claims) -> Result<Vec<ChatMessageView>> {
        self.authorize(alert_id, caller).await?;
        let mut views = Vec::new();
        for message in self.store.messages_for(alert_id).await {
            views.push(ChatMessageView {
                sender: self.store.account_summary(&message.sender_id).await,
                id: message.id,
                alert_id: message.alert_id,
                message: message.message,
                created_at: message.created_at,
            });
        }
        Ok(views)
    }

    pub async fn purge(&self, alert_id: &str, caller: &Claims) -> Result<usize> {
        self.authorize(alert_id, caller).await?;
        let removed = self.store.purge_messages(alert_id).await?;
        info!("Purged {removed} chat message(s) of alert {alert_id}");
        Ok(removed)
    }
}
