//! # peerlink-store
//!
//! Durable local state for a Peerlink node, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the four things a
//! node must remember across restarts: the local profile, the known-peer
//! list, the outbox of unacknowledged messages and the chat history.

pub mod chat;
pub mod database;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod peers;
pub mod profile;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
