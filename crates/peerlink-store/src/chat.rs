use rusqlite::params;

use peerlink_shared::constants::CHAT_HISTORY_LIMIT;
use peerlink_shared::protocol::MsgPayload;
use peerlink_shared::types::PeerIdentity;

use crate::database::Database;
use crate::error::Result;
use crate::models::{Direction, StoredChatMessage};

impl Database {
    /// Append a message to the history. Appending a msgId that is already
    /// present is a no-op; returns whether a row was added.
    ///
    /// Only the most recent [`CHAT_HISTORY_LIMIT`] entries are kept.
    pub fn append_chat_message(&self, msg: &StoredChatMessage) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO chat_history (msg_id, ts, from_json, payload_json, direction)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                msg.msg_id,
                msg.ts,
                serde_json::to_string(&msg.from)?,
                serde_json::to_string(&msg.payload)?,
                msg.direction.as_str(),
            ],
        )?;

        if inserted > 0 {
            self.conn().execute(
                "DELETE FROM chat_history WHERE seq NOT IN
                    (SELECT seq FROM chat_history ORDER BY seq DESC LIMIT ?1)",
                params![CHAT_HISTORY_LIMIT as i64],
            )?;
        }

        Ok(inserted > 0)
    }

    /// The whole history, oldest first.
    pub fn load_chat_history(&self) -> Result<Vec<StoredChatMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT msg_id, ts, from_json, payload_json, direction
             FROM chat_history ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (msg_id, ts, from_json, payload_json, direction) = row?;
            let from: serde_json::Result<PeerIdentity> = serde_json::from_str(&from_json);
            let payload: serde_json::Result<MsgPayload> = serde_json::from_str(&payload_json);
            match (from, payload, Direction::parse(&direction)) {
                (Ok(from), Ok(payload), Some(direction)) => history.push(StoredChatMessage {
                    msg_id,
                    ts,
                    from,
                    payload,
                    direction,
                }),
                _ => tracing::warn!(msg_id = %msg_id, "skipping corrupt chat history row"),
            }
        }
        Ok(history)
    }

    /// Message ids currently in the history.
    pub fn chat_message_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare("SELECT msg_id FROM chat_history")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn clear_chat_history(&self) -> Result<()> {
        self.conn().execute("DELETE FROM chat_history", [])?;
        Ok(())
    }
}
