use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::messages::ServerMessage;

/// A live websocket connection as the hub sees it.
#[derive(Clone)]
pub struct Participant {
    pub account_id: String,
    pub display_name: String,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Participant {
    pub fn new(account_id: String, display_name: String, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { account_id, display_name, sender }
    }
}

type Connections = Arc<RwLock<HashMap<String, Participant>>>; // connection_id -> participant
type Rooms = Arc<RwLock<HashMap<String, HashSet<String>>>>; // alert_id -> connection ids

/// In-process pub/sub keyed by alert id. Each connection owns an unbounded
/// queue drained by its writer task, so everything pushed to one connection
/// arrives in push order.
#[derive(Clone, Default)]
pub struct ChatHub {
    connections: Connections,
    rooms: Rooms,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str, participant: Participant) {
        let mut connections = self.connections.write().await;
        connections.insert(connection_id.to_string(), participant);
    }

    /// Forget a connection and drop it from every room it joined.
    pub async fn unregister(&self, connection_id: &str) {
        {
            let mut rooms = self.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(connection_id);
                !members.is_empty()
            });
        }
        let mut connections = self.connections.write().await;
        connections.remove(connection_id);
    }

    pub async fn participant(&self, connection_id: &str) -> Option<Participant> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn join(&self, alert_id: &str, connection_id: &str) {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(alert_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!("Connection {connection_id} joined room {alert_id}");
    }

    pub async fn leave(&self, alert_id: &str, connection_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(alert_id) else {
            return false;
        };
        let removed = members.remove(connection_id);
        if members.is_empty() {
            rooms.remove(alert_id);
        }
        removed
    }

    pub async fn is_member(&self, alert_id: &str, connection_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(alert_id)
            .is_some_and(|members| members.contains(connection_id))
    }

    pub async fn room_size(&self, alert_id: &str) -> usize {
        self.rooms.read().await.get(alert_id).map_or(0, HashSet::len)
    }

    pub async fn broadcast(&self, alert_id: &str, message: ServerMessage) -> usize {
        self.broadcast_except(alert_id, message, None).await
    }

    /// Push to every member of the room except `except`. Returns how many
    /// connections accepted the message.
    pub async fn broadcast_except(
        &self,
        alert_id: &str,
        message: ServerMessage,
        except: Option<&str>,
    ) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(alert_id) else {
            return 0;
        };
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for connection_id in members {
            if Some(connection_id.as_str()) == except {
                continue;
            }
            if let Some(participant) = connections.get(connection_id) {
                if participant.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn send_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(connection_id)
            .is_some_and(|p| p.sender.send(message).is_ok())
    }

    /// Tell everyone in the room it is gone, then dissolve it.
    pub async fn close_room(&self, alert_id: &str) {
        self.broadcast(alert_id, ServerMessage::RoomClosed { alert_id: alert_id.to_string() })
            .await;
        let mut rooms = self.rooms.write().await;
        if rooms.remove(alert_id).is_some() {
            info!("Room {alert_id} closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str) -> (Participant, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Participant::new(format!("acc-{name}"), name.to_string(), tx), rx)
    }

    fn error(message: &str) -> ServerMessage {
        ServerMessage::Error { message: message.to_string() }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let hub = ChatHub::new();
        let (a, mut rx_a) = participant("a");
        let (b, mut rx_b) = participant("b");
        let (c, mut rx_c) = participant("c");
        hub.register("ca", a).await;
        hub.register("cb", b).await;
        hub.register("cc", c).await;
        hub.join("room1", "ca").await;
        hub.join("room1", "cb").await;
        hub.join("room2", "cc").await;

        assert_eq!(hub.broadcast("room1", error("x")).await, 2);
        assert_eq!(rx_a.try_recv().unwrap(), error("x"));
        assert_eq!(rx_b.try_recv().unwrap(), error("x"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_sender() {
        let hub = ChatHub::new();
        let (a, mut rx_a) = participant("a");
        let (b, mut rx_b) = participant("b");
        hub.register("ca", a).await;
        hub.register("cb", b).await;
        hub.join("room1", "ca").await;
        hub.join("room1", "cb").await;

        assert_eq!(hub.broadcast_except("room1", error("typing"), Some("ca")).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), error("typing"));
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let hub = ChatHub::new();
        let (a, mut rx_a) = participant("a");
        hub.register("ca", a).await;
        hub.join("room1", "ca").await;
        for i in 0..50 {
            hub.broadcast("room1", error(&i.to_string())).await;
        }
        for i in 0..50 {
            assert_eq!(rx_a.recv().await.unwrap(), error(&i.to_string()));
        }
    }

    #[tokio::test]
    async fn unregister_removes_from_all_rooms() {
        let hub = ChatHub::new();
        let (a, _rx_a) = participant("a");
        hub.register("ca", a).await;
        hub.join("room1", "ca").await;
        hub.join("room2", "ca").await;
        hub.unregister("ca").await;
        assert!(!hub.is_member("room1", "ca").await);
        assert_eq!(hub.room_size("room2").await, 0);
        assert!(hub.participant("ca").await.is_none());
    }

    #[tokio::test]
    async fn closing_a_room_notifies_and_dissolves() {
        let hub = ChatHub::new();
        let (a, mut rx_a) = participant("a");
        hub.register("ca", a).await;
        hub.join("room1", "ca").await;
        hub.close_room("room1").await;
        assert_eq!(
            rx_a.try_recv().unwrap(),
            ServerMessage::RoomClosed { alert_id: "room1".to_string() }
        );
        assert!(!hub.is_member("room1", "ca").await);
    }
}
