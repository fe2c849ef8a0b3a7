/// Application tag carried in every HELLO payload
pub const APP_NAME: &str = "Peerlink";

/// Protocol version carried in every HELLO payload
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Default WebSocket listen port, also appended to peer addresses that
/// carry no explicit port
pub const DEFAULT_WS_PORT: u16 = 3002;

/// Heartbeat PING fan-out interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Offline sweep interval in seconds
pub const OFFLINE_SWEEP_INTERVAL_SECS: u64 = 10;

/// An online peer not seen for this long is marked offline
pub const OFFLINE_TIMEOUT_SECS: u64 = 45;

/// Reconnect-to-offline-peers sweep interval in seconds
pub const RECONNECT_INTERVAL_SECS: u64 = 20;

/// Outbox retry interval in seconds
pub const RETRY_INTERVAL_SECS: u64 = 5;

/// Send attempts after which a pending message is dropped as failed
pub const MAX_SEND_ATTEMPTS: u32 = 20;

/// Delays (ms) of the extra send attempts made right after enqueueing,
/// to absorb handshake latency
pub const EARLY_RETRY_DELAYS_MS: [u64; 2] = [500, 1_500];

/// Resume-from-suspend watcher tick in seconds
pub const RESUME_CHECK_INTERVAL_SECS: u64 = 5;

/// Wall clock running ahead of the monotonic clock by more than this
/// (seconds) is taken as a resume from suspend
pub const RESUME_JUMP_THRESHOLD_SECS: u64 = 30;

/// Maximum number of chat history entries kept on disk
pub const CHAT_HISTORY_LIMIT: usize = 1_500;
