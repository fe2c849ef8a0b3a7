//! Host settings loaded from environment variables.
//!
//! Protocol timers live in [`peerlink_net::NodeConfig`]; this covers what
//! the desktop shell would otherwise provide.

use std::path::PathBuf;

use peerlink_store::ProfileInput;

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Env: `PEERLINK_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Peer addresses dialed at startup.
    /// Env: `PEERLINK_BOOTSTRAP` (comma-separated)
    pub bootstrap: Vec<String>,

    /// Profile registered on first start when no profile exists yet.
    /// Env: `PEERLINK_NAME`, `PEERLINK_EMAIL`, `PEERLINK_IP` (all three)
    pub profile: Option<ProfileInput>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("PEERLINK_DB_PATH").filter(|p| !p.trim().is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(list) = lookup("PEERLINK_BOOTSTRAP") {
            config.bootstrap = list
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(String::from)
                .collect();
        }

        match (
            lookup("PEERLINK_NAME"),
            lookup("PEERLINK_EMAIL"),
            lookup("PEERLINK_IP"),
        ) {
            (Some(name), Some(email), Some(ip)) => {
                config.profile = Some(ProfileInput { name, email, ip });
            }
            (None, None, None) => {}
            _ => tracing::warn!(
                "PEERLINK_NAME, PEERLINK_EMAIL and PEERLINK_IP must be set together, ignoring"
            ),
        }

        config
    }
}
