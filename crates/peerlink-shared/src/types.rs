use serde::{Deserialize, Serialize};

/// Stable user identifier, generated once when the profile is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a node advertises about itself and gossips about others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub user_id: UserId,
    pub name: String,
    /// Routable address: a bare host, or `host:port` when the peer does
    /// not listen on the default port.
    pub ip: String,
}

impl PeerIdentity {
    pub fn new(user_id: impl Into<UserId>, name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            ip: ip.into(),
        }
    }

    /// All three fields must be non-blank before an identity received from
    /// the network is merged anywhere.
    pub fn is_valid(&self) -> bool {
        !self.user_id.0.trim().is_empty() && !self.name.trim().is_empty() && !self.ip.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Offline,
    Connecting,
    Online,
}

/// A directory entry: identity plus liveness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    #[serde(flatten)]
    pub identity: PeerIdentity,
    pub status: PeerStatus,
    /// Last time (epoch millis) the peer proved it was alive. `None` for
    /// peers only ever heard of through gossip or loaded from disk.
    pub last_seen: Option<i64>,
    /// Which peer introduced this entry through gossip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_via: Option<PeerIdentity>,
}

impl Peer {
    /// A freshly learned peer, offline until proven otherwise.
    pub fn offline(identity: PeerIdentity) -> Self {
        Self {
            identity,
            status: PeerStatus::Offline,
            last_seen: None,
            discovered_via: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }
}

/// The local user's registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub ip: String,
    pub created_at: i64,
}

impl Profile {
    /// The part of the profile advertised to other nodes.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            ip: self.ip.clone(),
        }
    }
}
