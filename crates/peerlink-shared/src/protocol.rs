use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::{APP_NAME, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::types::{PeerIdentity, UserId};

/// Type tag of every frame exchanged between nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Hello,
    HelloAck,
    Ping,
    Pong,
    Peers,
    PeersAck,
    Msg,
    Ack,
}

/// Decoded body of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Dialer introduces itself right after the socket opens
    Hello(HelloPayload),
    /// Listener accepts the dialer
    HelloAck(HelloAckPayload),
    Ping,
    Pong,
    /// Gossip: the sender's view of the network
    Peers(PeersPayload),
    PeersAck(PeersAckPayload),
    /// Application message; the envelope msgId is the message's own id
    Msg(MsgPayload),
    /// Acknowledges a `Msg` by its msgId
    Ack(AckPayload),
}

impl Frame {
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::Hello(_) => FrameType::Hello,
            Frame::HelloAck(_) => FrameType::HelloAck,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::Peers(_) => FrameType::Peers,
            Frame::PeersAck(_) => FrameType::PeersAck,
            Frame::Msg(_) => FrameType::Msg,
            Frame::Ack(_) => FrameType::Ack,
        }
    }

    fn payload_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Frame::Hello(p) => serde_json::to_value(p),
            Frame::HelloAck(p) => serde_json::to_value(p),
            Frame::Ping | Frame::Pong => Ok(Value::Object(Default::default())),
            Frame::Peers(p) => serde_json::to_value(p),
            Frame::PeersAck(p) => serde_json::to_value(p),
            Frame::Msg(p) => serde_json::to_value(p),
            Frame::Ack(p) => serde_json::to_value(p),
        }
    }

    fn from_parts(kind: FrameType, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            FrameType::Hello => Frame::Hello(serde_json::from_value(payload)?),
            FrameType::HelloAck => Frame::HelloAck(serde_json::from_value(payload)?),
            FrameType::Ping => Frame::Ping,
            FrameType::Pong => Frame::Pong,
            FrameType::Peers => Frame::Peers(serde_json::from_value(payload)?),
            FrameType::PeersAck => Frame::PeersAck(serde_json::from_value(payload)?),
            FrameType::Msg => Frame::Msg(serde_json::from_value(payload)?),
            FrameType::Ack => Frame::Ack(serde_json::from_value(payload)?),
        })
    }
}

/// The outer wrapper of every frame.
///
/// `msg_id` is fresh for every frame except `Msg`, whose msgId is the
/// message's stable identity used for dedup and ACK correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct WsEnvelope {
    pub msg_id: String,
    pub ts: i64,
    pub from: PeerIdentity,
    pub frame: Frame,
}

/// On-the-wire shape of [`WsEnvelope`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: FrameType,
    msg_id: String,
    ts: i64,
    from: PeerIdentity,
    #[serde(default)]
    payload: Value,
}

impl WsEnvelope {
    /// Wrap a frame with a fresh msgId and the current timestamp.
    pub fn new(from: PeerIdentity, frame: Frame) -> Self {
        Self {
            msg_id: crate::new_id(),
            ts: crate::now_millis(),
            from,
            frame,
        }
    }

    pub fn kind(&self) -> FrameType {
        self.frame.kind()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let raw = RawEnvelope {
            kind: self.frame.kind(),
            msg_id: self.msg_id.clone(),
            ts: self.ts,
            from: self.from.clone(),
            payload: self.frame.payload_value()?,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Decode a text frame. Unknown types, missing fields and a blank
    /// sender identity are all rejected.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        if !raw.from.is_valid() {
            return Err(ProtocolError::InvalidSender);
        }
        let frame = Frame::from_parts(raw.kind, raw.payload)?;
        Ok(Self {
            msg_id: raw.msg_id,
            ts: raw.ts,
            from: raw.from,
            frame,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HelloPayload {
    pub app: String,
    pub version: String,
}

impl Default for HelloPayload {
    fn default() -> Self {
        Self {
            app: APP_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloAckPayload {
    pub accepted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeersPayload {
    /// Only well-formed identities survive decoding; malformed entries are
    /// dropped one by one instead of failing the whole frame.
    #[serde(default, deserialize_with = "lenient_peers")]
    pub peers: Vec<PeerIdentity>,
}

fn lenient_peers<'de, D>(deserializer: D) -> Result<Vec<PeerIdentity>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| serde_json::from_value::<PeerIdentity>(v).ok())
        .filter(PeerIdentity::is_valid)
        .collect())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeersAckPayload {
    pub received: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub ack_msg_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgKind {
    Chat,
    System,
    FileEvent,
}

/// Addressing mode of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Dm,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MsgPayload {
    pub kind: MsgKind,
    pub text: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<Value>,
}

impl MsgPayload {
    pub fn direct(to_user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            kind: MsgKind::Chat,
            text: text.into(),
            scope: Scope::Dm,
            to_user_id: Some(to_user_id),
            group_id: None,
            file_ref: None,
        }
    }

    pub fn public(group_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: MsgKind::Chat,
            text: text.into(),
            scope: Scope::Public,
            to_user_id: None,
            group_id: Some(group_id.into()),
            file_ref: None,
        }
    }

    /// Whether this message is a DM addressed to someone other than `me`.
    pub fn is_dm_for_other(&self, me: &UserId) -> bool {
        self.scope == Scope::Dm && self.to_user_id.as_ref().is_some_and(|to| to != me)
    }
}
