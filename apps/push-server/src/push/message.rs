use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use push_common::id::{prefix, prefixed_ulid};
use serde_json::Value;

use crate::condition::Condition;
use crate::connection::PushPayload;

use super::flow::FlowSettings;

/// A message to broadcast to every matching local connection.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub id: String,
    pub content: Value,
    pub condition: Condition,
    /// Overrides the server's default flow control for this broadcast.
    pub flow: Option<FlowSettings>,
    /// Identifies the resource the broadcast belongs to; its passes run on
    /// the scheduler lane this key maps to.
    pub lane_key: u64,
}

impl PushMessage {
    pub fn new(content: Value, condition: Condition) -> Self {
        let id = prefixed_ulid(prefix::MESSAGE);
        let lane_key = lane_key_for(&id);
        Self {
            id,
            content,
            condition,
            flow: None,
            lane_key,
        }
    }

    pub fn with_flow(mut self, flow: FlowSettings) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn with_lane_key(mut self, lane_key: u64) -> Self {
        self.lane_key = lane_key;
        self
    }

    pub fn payload(&self) -> Arc<PushPayload> {
        Arc::new(PushPayload {
            message_id: self.id.clone(),
            content: self.content.clone(),
        })
    }
}

/// Stable lane key for an originating resource id.
pub fn lane_key_for(resource_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    resource_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_prefixed_id_and_lane() {
        let msg = PushMessage::new(serde_json::json!({"title": "hi"}), Condition::Always);
        assert!(msg.id.starts_with("msg_"));
        assert_eq!(msg.lane_key, lane_key_for(&msg.id));
        assert!(msg.flow.is_none());
    }

    #[test]
    fn payload_carries_id_and_content() {
        let msg = PushMessage::new(serde_json::json!({"n": 1}), Condition::Always);
        let payload = msg.payload();
        assert_eq!(payload.message_id, msg.id);
        assert_eq!(payload.content["n"], 1);
    }

    #[test]
    fn lane_key_is_stable() {
        assert_eq!(lane_key_for("conn_1"), lane_key_for("conn_1"));
    }
}
