use rusqlite::params;

use peerlink_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::PendingOutboxMessage;

impl Database {
    /// Every pending message, oldest first.
    pub fn load_outbox(&self) -> Result<Vec<PendingOutboxMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT msg_id, ts, to_user_id, to_ip, from_json, payload_json, group_id,
                    attempts, last_attempt_at
             FROM outbox ORDER BY ts ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(OutboxRow {
                msg_id: row.get(0)?,
                ts: row.get(1)?,
                to_user_id: row.get(2)?,
                to_ip: row.get(3)?,
                from_json: row.get(4)?,
                payload_json: row.get(5)?,
                group_id: row.get(6)?,
                attempts: row.get(7)?,
                last_attempt_at: row.get(8)?,
            })
        })?;

        let mut pending = Vec::new();
        for row in rows {
            let row = row?;
            match row.decode() {
                Ok(msg) => pending.push(msg),
                Err(e) => {
                    tracing::warn!(msg_id = %row.msg_id, error = %e, "skipping corrupt outbox row");
                }
            }
        }
        Ok(pending)
    }

    pub fn upsert_outbox(&self, msg: &PendingOutboxMessage) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO outbox
                (msg_id, ts, to_user_id, to_ip, from_json, payload_json, group_id,
                 attempts, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                msg.msg_id,
                msg.ts,
                msg.to_user_id.as_str(),
                msg.to_ip,
                serde_json::to_string(&msg.from)?,
                serde_json::to_string(&msg.payload)?,
                msg.group_id,
                msg.attempts,
                msg.last_attempt_at,
            ],
        )?;
        Ok(())
    }

    pub fn remove_outbox(&self, msg_id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM outbox WHERE msg_id = ?1", params![msg_id])?;
        Ok(affected > 0)
    }
}

struct OutboxRow {
    msg_id: String,
    ts: i64,
    to_user_id: String,
    to_ip: String,
    from_json: String,
    payload_json: String,
    group_id: Option<String>,
    attempts: u32,
    last_attempt_at: Option<i64>,
}

impl OutboxRow {
    fn decode(&self) -> serde_json::Result<PendingOutboxMessage> {
        Ok(PendingOutboxMessage {
            msg_id: self.msg_id.clone(),
            ts: self.ts,
            to_user_id: UserId(self.to_user_id.clone()),
            to_ip: self.to_ip.clone(),
            from: serde_json::from_str(&self.from_json)?,
            payload: serde_json::from_str(&self.payload_json)?,
            group_id: self.group_id.clone(),
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_shared::protocol::MsgPayload;
    use peerlink_shared::types::PeerIdentity;

    fn pending(msg_id: &str, ts: i64) -> PendingOutboxMessage {
        PendingOutboxMessage {
            msg_id: msg_id.into(),
            ts,
            to_user_id: UserId::from("b"),
            to_ip: "10.0.0.2".into(),
            from: PeerIdentity::new("a", "Alice", "10.0.0.1"),
            payload: MsgPayload::direct(UserId::from("b"), "hi"),
            group_id: None,
            attempts: 0,
            last_attempt_at: None,
        }
    }

    #[test]
    fn test_upsert_load_remove() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_outbox(&pending("m2", 20)).unwrap();
        db.upsert_outbox(&pending("m1", 10)).unwrap();

        let mut updated = pending("m2", 20);
        updated.attempts = 3;
        updated.last_attempt_at = Some(99);
        db.upsert_outbox(&updated).unwrap();

        let loaded = db.load_outbox().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].msg_id, "m1");
        assert_eq!(loaded[1], updated);

        assert!(db.remove_outbox("m1").unwrap());
        assert!(!db.remove_outbox("m1").unwrap());
        assert_eq!(db.load_outbox().unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.db");

        {
            let db = Database::open_at(&path).unwrap();
            let mut msg = pending("m1", 10);
            msg.group_id = Some("g1".into());
            db.upsert_outbox(&msg).unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let loaded = db.load_outbox().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].group_id.as_deref(), Some("g1"));
    }
}
