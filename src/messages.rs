use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "joinRoom")]
    JoinRoom {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    #[serde(rename = "leaveRoom")]
    LeaveRoom {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    #[serde(rename = "sendMessage")]
    SendMessage {
        #[serde(rename = "alertId")]
        alert_id: String,
        message: String,
    },
    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    #[serde(rename = "roomJoined")]
    RoomJoined {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    #[serde(rename = "receiveMessage")]
    ReceiveMessage {
        sender: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "typing")]
    Typing {
        sender: String,
        #[serde(rename = "expiresInMs")]
        expires_in_ms: u64,
    },
    #[serde(rename = "roomClosed")]
    RoomClosed {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
    },
}
