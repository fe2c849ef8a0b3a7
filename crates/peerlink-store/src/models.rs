//! Records persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use serde::{Deserialize, Serialize};

use peerlink_shared::protocol::MsgPayload;
use peerlink_shared::types::{PeerIdentity, UserId};

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Registration form as typed by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInput {
    pub name: String,
    pub email: String,
    pub ip: String,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// An outbound message that has not been acknowledged yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingOutboxMessage {
    /// Stable message id, reused on every retry.
    pub msg_id: String,
    /// Creation time (epoch millis); sent as the envelope `ts`.
    pub ts: i64,
    pub to_user_id: UserId,
    pub to_ip: String,
    pub from: PeerIdentity,
    pub payload: MsgPayload,
    /// Set for the per-recipient copies of a PUBLIC send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Number of frames actually handed to a live socket.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Chat history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// A message as kept in the local chat history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredChatMessage {
    pub msg_id: String,
    pub ts: i64,
    pub from: PeerIdentity,
    pub payload: MsgPayload,
    pub direction: Direction,
}
