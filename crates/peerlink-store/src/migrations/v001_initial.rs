//! v001 -- Initial schema creation.
//!
//! Creates the four node tables: `profile`, `known_peers`, `outbox`, and
//! `chat_history`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Local profile (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profile (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    user_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    email      TEXT NOT NULL,
    ip         TEXT NOT NULL,
    created_at INTEGER NOT NULL              -- epoch millis
);

-- ----------------------------------------------------------------
-- Known peers (identity only; liveness is never persisted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS known_peers (
    user_id TEXT PRIMARY KEY NOT NULL,
    name    TEXT NOT NULL,
    ip      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Outbox of messages awaiting an ACK
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    msg_id          TEXT PRIMARY KEY NOT NULL,
    ts              INTEGER NOT NULL,
    to_user_id      TEXT NOT NULL,
    to_ip           TEXT NOT NULL,
    from_json       TEXT NOT NULL,            -- PeerIdentity
    payload_json    TEXT NOT NULL,            -- MsgPayload
    group_id        TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outbox_to_user ON outbox(to_user_id);

-- ----------------------------------------------------------------
-- Chat history (bounded, insertion ordered)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_history (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id       TEXT NOT NULL UNIQUE,
    ts           INTEGER NOT NULL,
    from_json    TEXT NOT NULL,               -- PeerIdentity
    payload_json TEXT NOT NULL,               -- MsgPayload
    direction    TEXT NOT NULL                -- 'in' | 'out'
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
