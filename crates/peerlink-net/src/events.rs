//! Events pushed to the UI layer.
//!
//! The node never waits on the UI: events go through a
//! `tokio::sync::broadcast` channel, and an absent or lagging subscriber
//! only loses events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use peerlink_shared::protocol::MsgPayload;
use peerlink_shared::types::{Peer, PeerIdentity, UserId};

use crate::delivery::GroupProgress;

pub const EVENT_PEERS_UPDATE: &str = "peers:update";
pub const EVENT_MSG_RECEIVED: &str = "msg:received";
pub const EVENT_MSG_STATUS: &str = "msg:status";

/// Delivery state of an outbound message or broadcast group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
}

/// Payload of a `msg:status` event.
///
/// `key` is the msgId for a DM and the groupId for every event belonging
/// to a PUBLIC send; group aggregates carry `progress` and no msgId.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<GroupProgress>,
}

/// Payload of a `msg:received` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub msg_id: String,
    pub from: PeerIdentity,
    pub ts: i64,
    pub payload: MsgPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Full directory snapshot, sorted by name.
    PeersUpdated(Vec<Peer>),
    MessageReceived(ReceivedMessage),
    DeliveryStatus(DeliveryUpdate),
}

impl NodeEvent {
    /// Channel name the UI listens on.
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::PeersUpdated(_) => EVENT_PEERS_UPDATE,
            NodeEvent::MessageReceived(_) => EVENT_MSG_RECEIVED,
            NodeEvent::DeliveryStatus(_) => EVENT_MSG_STATUS,
        }
    }

    /// The event body as handed to the UI.
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            NodeEvent::PeersUpdated(peers) => serde_json::to_value(peers),
            NodeEvent::MessageReceived(msg) => serde_json::to_value(msg),
            NodeEvent::DeliveryStatus(update) => serde_json::to_value(update),
        }
    }
}

/// Fan-out of [`NodeEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: NodeEvent) {
        // An error only means nobody is subscribed right now.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_shape() {
        let event = NodeEvent::DeliveryStatus(DeliveryUpdate {
            key: "g1".into(),
            msg_id: None,
            to_user_id: None,
            status: DeliveryStatus::Sent,
            progress: Some(GroupProgress {
                total: 3,
                delivered: 1,
            }),
        });

        assert_eq!(event.name(), "msg:status");
        let json = event.payload_json().unwrap();
        assert_eq!(json["key"], "g1");
        assert_eq!(json["status"], "sent");
        assert_eq!(json["progress"]["total"], 3);
        assert!(json.get("msgId").is_none());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::new(4);
        sink.emit(NodeEvent::PeersUpdated(Vec::new()));

        let mut rx = sink.subscribe();
        sink.emit(NodeEvent::PeersUpdated(Vec::new()));
        assert_eq!(rx.try_recv().unwrap().name(), "peers:update");
    }
}
