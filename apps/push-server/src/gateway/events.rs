//! Gateway opcodes and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::PushPayload;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_PUSH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_HANDSHAKE: u8 = 2;
pub const OP_HANDSHAKE_OK: u8 = 4;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_KICK: u8 = 8;

/// Event name carried in `t` for pushes.
pub const EVENT_PUSH: &str = "PUSH";

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a PUSH message (op=0).
    pub fn push(seq: u64, payload: &PushPayload) -> Self {
        Self {
            op: OP_PUSH,
            t: Some(EVENT_PUSH.to_string()),
            s: Some(seq),
            d: serde_json::json!({
                "message_id": payload.message_id,
                "content": payload.content,
            }),
        }
    }

    /// Build a HANDSHAKE_OK message (op=4).
    pub fn handshake_ok(connection_id: &str, heartbeat_interval_ms: u64) -> Self {
        Self {
            op: OP_HANDSHAKE_OK,
            t: None,
            s: None,
            d: serde_json::json!({
                "connection_id": connection_id,
                "heartbeat_interval": heartbeat_interval_ms,
            }),
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }

    /// Build a KICK message (op=8) sent right before the server closes a
    /// connection on its own initiative.
    pub fn kick(reason: &str) -> Self {
        Self {
            op: OP_KICK,
            t: None,
            s: None,
            d: serde_json::json!({ "reason": reason }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// HANDSHAKE payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HandshakePayload {
    pub user_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    /// Requested heartbeat interval; clamped by the server.
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// HEARTBEAT payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}
