//! State shared by every task of one node.
//!
//! Lock order: `directory` and `outbox` are never held together, and the
//! database lock is always taken last.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use peerlink_shared::types::{PeerIdentity, Profile};
use peerlink_store::Database;

use crate::config::NodeConfig;
use crate::delivery::Outbox;
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::events::EventSink;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct NodeContext {
    pub config: NodeConfig,
    pub db: Arc<Mutex<Database>>,
    pub directory: Mutex<PeerDirectory>,
    pub outbox: Mutex<Outbox>,
    pub events: EventSink,
    /// Addresses with a dial in flight or a dialed connection still open.
    dialing: Mutex<HashSet<String>>,
    /// msgIds of inbound messages already surfaced.
    seen_msgs: Mutex<HashSet<String>>,
    /// Digests of peer lists already forwarded.
    seen_gossip: Mutex<HashSet<u64>>,
}

impl NodeContext {
    /// Load the directory, outbox and dedup set from `db`.
    pub fn new(config: NodeConfig, db: Database) -> Result<Arc<Self>> {
        let events = EventSink::new(config.event_capacity);
        let (pending, seen) = (db.load_outbox()?, db.chat_message_ids()?);
        let db = Arc::new(Mutex::new(db));
        let directory = PeerDirectory::load(Arc::clone(&db), events.clone())?;

        tracing::info!(
            peers = directory.len(),
            pending = pending.len(),
            "Node state loaded"
        );

        Ok(Arc::new(Self {
            directory: Mutex::new(directory),
            outbox: Mutex::new(Outbox::from_records(pending)),
            seen_msgs: Mutex::new(seen.into_iter().collect()),
            seen_gossip: Mutex::new(HashSet::new()),
            dialing: Mutex::new(HashSet::new()),
            config,
            db,
            events,
        }))
    }

    pub fn profile(&self) -> Option<Profile> {
        match lock(&self.db).get_profile() {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Failed to read profile");
                None
            }
        }
    }

    /// Identity advertised by this node, if registered.
    pub fn local_identity(&self) -> Option<PeerIdentity> {
        self.profile().map(|p| p.identity())
    }

    /// Claim `addr` for dialing. Returns `false` if it is already claimed.
    pub fn begin_dial(&self, addr: &str) -> bool {
        lock(&self.dialing).insert(addr.to_string())
    }

    pub fn end_dial(&self, addr: &str) {
        lock(&self.dialing).remove(addr);
    }

    #[cfg(test)]
    pub(crate) fn is_dialing(&self, addr: &str) -> bool {
        lock(&self.dialing).contains(addr)
    }

    /// Record an inbound msgId. Returns `true` the first time it is seen.
    pub fn mark_msg_seen(&self, msg_id: &str) -> bool {
        lock(&self.seen_msgs).insert(msg_id.to_string())
    }

    /// Record a peer list. Returns `true` the first time this exact set
    /// of `(userId, ip)` pairs is seen, in any order.
    pub fn first_gossip_sighting(&self, peers: &[PeerIdentity]) -> bool {
        lock(&self.seen_gossip).insert(gossip_digest(peers))
    }
}

fn gossip_digest(peers: &[PeerIdentity]) -> u64 {
    let mut pairs: Vec<(&str, &str)> = peers
        .iter()
        .map(|p| (p.user_id.as_str(), p.ip.as_str()))
        .collect();
    pairs.sort_unstable();
    pairs.dedup();

    let mut hasher = DefaultHasher::new();
    pairs.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<NodeContext> {
        NodeContext::new(NodeConfig::default(), Database::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_dial_guard() {
        let ctx = context();
        assert!(ctx.begin_dial("10.0.0.2"));
        assert!(!ctx.begin_dial("10.0.0.2"));
        ctx.end_dial("10.0.0.2");
        assert!(ctx.begin_dial("10.0.0.2"));
    }

    #[test]
    fn test_gossip_digest_ignores_order() {
        let ctx = context();
        let a = PeerIdentity::new("a", "Alice", "10.0.0.1");
        let b = PeerIdentity::new("b", "Bob", "10.0.0.2");

        assert!(ctx.first_gossip_sighting(&[a.clone(), b.clone()]));
        assert!(!ctx.first_gossip_sighting(&[b.clone(), a.clone()]));
        assert!(ctx.first_gossip_sighting(&[a]));
    }

    #[test]
    fn test_seen_seeded_from_history() {
        use peerlink_shared::protocol::MsgPayload;
        use peerlink_store::{Direction, StoredChatMessage};

        let db = Database::open_in_memory().unwrap();
        db.append_chat_message(&StoredChatMessage {
            msg_id: "m1".into(),
            ts: 1,
            from: PeerIdentity::new("b", "Bob", "10.0.0.2"),
            payload: MsgPayload::public("g", "hi"),
            direction: Direction::In,
        })
        .unwrap();

        let ctx = NodeContext::new(NodeConfig::default(), db).unwrap();
        assert!(!ctx.mark_msg_seen("m1"));
        assert!(ctx.mark_msg_seen("m2"));
    }
}
