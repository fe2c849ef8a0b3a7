//! Types shared by every Peerlink crate: peer identities, the wire
//! envelope and its payloads, protocol constants and errors.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{Frame, FrameType, MsgKind, MsgPayload, Scope, WsEnvelope};
pub use types::{Peer, PeerIdentity, PeerStatus, Profile, UserId};

/// Current time as Unix epoch milliseconds, the unit of every `ts` and
/// `lastSeen` field on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh random identifier for envelopes, messages and groups.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
