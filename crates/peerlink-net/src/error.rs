use thiserror::Error;

use peerlink_shared::types::UserId;
use peerlink_shared::ProtocolError;
use peerlink_store::StoreError;

/// Errors surfaced by node operations.
///
/// Transport failures of background dials are logged and dropped; only
/// explicit calls (`connect`, `send_dm`, `register`, ...) return them.
#[derive(Error, Debug)]
pub enum NetError {
    /// Caller-supplied data was rejected (e.g. a blank profile field).
    #[error("{0}")]
    Validation(String),

    /// No local profile is registered yet.
    #[error("You must register before sending or connecting")]
    NotRegistered,

    /// The send target is not in the peer directory.
    #[error("Unknown peer: {0}")]
    UnknownPeer(UserId),

    /// WebSocket handshake or transport failure.
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    /// The connection's writer has already shut down.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl NetError {
    /// Like the `From` impl, but keeps registration validation failures
    /// as [`NetError::Validation`] so callers can show the message as is.
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => NetError::Validation(msg),
            other => NetError::Store(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
