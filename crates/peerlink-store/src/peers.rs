use rusqlite::params;

use peerlink_shared::types::{PeerIdentity, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn load_known_peers(&self) -> Result<Vec<PeerIdentity>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id, name, ip FROM known_peers ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(PeerIdentity {
                user_id: UserId(row.get(0)?),
                name: row.get(1)?,
                ip: row.get(2)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Replace the stored peer list with `peers`.
    pub fn save_known_peers(&self, peers: &[PeerIdentity]) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM known_peers", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO known_peers (user_id, name, ip) VALUES (?1, ?2, ?3)")?;
            for peer in peers {
                stmt.execute(params![peer.user_id.as_str(), peer.name, peer.ip])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_replaces_list() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_known_peers().unwrap().is_empty());

        db.save_known_peers(&[
            PeerIdentity::new("b", "Bob", "10.0.0.2"),
            PeerIdentity::new("a", "Alice", "10.0.0.1"),
        ])
        .unwrap();
        let loaded = db.load_known_peers().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "Alice");

        db.save_known_peers(&[PeerIdentity::new("c", "Carol", "10.0.0.3")])
            .unwrap();
        let loaded = db.load_known_peers().unwrap();
        assert_eq!(loaded, vec![PeerIdentity::new("c", "Carol", "10.0.0.3")]);
    }
}
