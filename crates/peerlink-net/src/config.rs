//! Node configuration loaded from environment variables.
//!
//! Every setting has a default, so a node starts with zero configuration.

use std::net::SocketAddr;
use std::time::Duration;

use peerlink_shared::constants::{
    DEFAULT_WS_PORT, EARLY_RETRY_DELAYS_MS, HEARTBEAT_INTERVAL_SECS, MAX_SEND_ATTEMPTS,
    OFFLINE_SWEEP_INTERVAL_SECS, OFFLINE_TIMEOUT_SECS, RECONNECT_INTERVAL_SECS,
    RESUME_CHECK_INTERVAL_SECS, RESUME_JUMP_THRESHOLD_SECS, RETRY_INTERVAL_SECS,
};

/// Timers, limits and addresses of a running node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the WebSocket listener binds to.
    /// Env: `PEERLINK_LISTEN_ADDR`
    /// Default: `0.0.0.0:3002`
    pub listen_addr: SocketAddr,

    /// Port appended to peer addresses that do not carry one.
    /// Env: `PEERLINK_PEER_PORT`
    /// Default: `3002`
    pub default_peer_port: u16,

    /// Env: `PEERLINK_HEARTBEAT_SECS`
    /// Default: 15 s
    pub heartbeat_interval: Duration,

    /// Env: `PEERLINK_OFFLINE_SWEEP_SECS`
    /// Default: 10 s
    pub offline_sweep_interval: Duration,

    /// An online peer silent for longer than this is marked offline.
    /// Env: `PEERLINK_OFFLINE_TIMEOUT_SECS`
    /// Default: 45 s
    pub offline_timeout: Duration,

    /// Env: `PEERLINK_RECONNECT_SECS`
    /// Default: 20 s
    pub reconnect_interval: Duration,

    /// Tick of the outbox retry loop, and the minimum gap between two
    /// attempts of the same message.
    /// Env: `PEERLINK_RETRY_SECS`
    /// Default: 5 s
    pub retry_interval: Duration,

    /// Attempts after which a pending message is reported as failed.
    /// Env: `PEERLINK_MAX_ATTEMPTS`
    /// Default: 20
    pub max_attempts: u32,

    /// Re-attempts scheduled right after a send, to cover the handshake
    /// of a freshly dialed connection.
    pub early_retry_delays: Vec<Duration>,

    pub resume_check_interval: Duration,

    /// A wall-clock jump larger than this between two resume checks is
    /// treated as the host waking from suspend.
    pub resume_jump_threshold: Duration,

    /// Buffer of the UI event channel; slow subscribers lose the oldest
    /// events.
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_WS_PORT).into(),
            default_peer_port: DEFAULT_WS_PORT,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            offline_sweep_interval: Duration::from_secs(OFFLINE_SWEEP_INTERVAL_SECS),
            offline_timeout: Duration::from_secs(OFFLINE_TIMEOUT_SECS),
            reconnect_interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
            retry_interval: Duration::from_secs(RETRY_INTERVAL_SECS),
            max_attempts: MAX_SEND_ATTEMPTS,
            early_retry_delays: EARLY_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            resume_check_interval: Duration::from_secs(RESUME_CHECK_INTERVAL_SECS),
            resume_jump_threshold: Duration::from_secs(RESUME_JUMP_THRESHOLD_SECS),
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("PEERLINK_LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "Invalid PEERLINK_LISTEN_ADDR, using default")
                }
            }
        }

        if let Some(port) = parse_var(&lookup, "PEERLINK_PEER_PORT") {
            config.default_peer_port = port;
        }

        let secs = |key: &str| parse_var::<u64>(&lookup, key).map(Duration::from_secs);

        if let Some(d) = secs("PEERLINK_HEARTBEAT_SECS") {
            config.heartbeat_interval = d;
        }
        if let Some(d) = secs("PEERLINK_OFFLINE_SWEEP_SECS") {
            config.offline_sweep_interval = d;
        }
        if let Some(d) = secs("PEERLINK_OFFLINE_TIMEOUT_SECS") {
            config.offline_timeout = d;
        }
        if let Some(d) = secs("PEERLINK_RECONNECT_SECS") {
            config.reconnect_interval = d;
        }
        if let Some(d) = secs("PEERLINK_RETRY_SECS") {
            config.retry_interval = d;
        }

        if let Some(n) = parse_var(&lookup, "PEERLINK_MAX_ATTEMPTS") {
            config.max_attempts = n;
        }

        config
    }
}

/// Parse a variable, warning about values that are present but invalid.
/// Zero is rejected: none of the numeric settings accept it.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v != T::default() => Some(v),
        _ => {
            tracing::warn!(value = %raw, "Invalid {key}, using default");
            None
        }
    }
}
