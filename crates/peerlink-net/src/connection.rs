//! Handle to one live WebSocket connection.
//!
//! The socket itself is owned by its session task; everyone else holds a
//! cheap [`PeerConnection`] that queues frames for the session's writer.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use peerlink_shared::protocol::WsEnvelope;

use crate::error::{NetError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Work item for a session's writer task.
#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct PeerConnection {
    id: u64,
    addr: String,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl PeerConnection {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(addr: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.into(),
            tx,
        };
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address as dialed, or as reported by the listener.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue an envelope for sending.
    pub fn send(&self, envelope: &WsEnvelope) -> Result<()> {
        let json = envelope.to_json()?;
        self.tx
            .send(Outgoing::Text(json))
            .map_err(|_| NetError::ConnectionClosed)
    }

    /// Whether the writer task is still running.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Ask the writer to send a close frame and stop.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

impl PartialEq for PeerConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerConnection {}

/// WebSocket URL for a peer address.
///
/// Accepts a bare IP or host (the default port is appended), `host:port`,
/// `[v6]:port`, or a full `ws://` / `wss://` URL.
pub fn ws_url(addr: &str, default_port: u16) -> String {
    let addr = addr.trim();
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        return addr.to_string();
    }
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return format!("ws://{socket}");
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return format!("ws://{}", SocketAddr::new(ip, default_port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            format!("ws://{host}:{port}")
        }
        _ => format!("ws://{addr}:{default_port}"),
    }
}
