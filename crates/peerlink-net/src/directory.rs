//! Peer directory and socket registry.
//!
//! Keeps every peer this node has heard of, its liveness, and the live
//! connection bound to it (if any). Every mutation persists the identity
//! list and pushes a sorted snapshot to the UI.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use peerlink_shared::protocol::{Frame, PeersPayload, WsEnvelope};
use peerlink_shared::types::{Peer, PeerIdentity, PeerStatus, UserId};
use peerlink_store::{Database, StoreError};

use crate::connection::PeerConnection;
use crate::context::lock;
use crate::events::{EventSink, NodeEvent};

/// Fields to merge into a directory entry. `None` leaves the current value.
#[derive(Debug, Clone, Default)]
pub struct PeerPatch {
    pub status: Option<PeerStatus>,
    /// Proof of life; ignored if older than the stored value.
    pub last_seen: Option<i64>,
    pub discovered_via: Option<PeerIdentity>,
}

impl PeerPatch {
    pub fn online(now: i64) -> Self {
        Self {
            status: Some(PeerStatus::Online),
            last_seen: Some(now),
            discovered_via: None,
        }
    }
}

pub struct PeerDirectory {
    peers: HashMap<UserId, Peer>,
    sockets: HashMap<UserId, PeerConnection>,
    store: Arc<Mutex<Database>>,
    events: EventSink,
}

impl PeerDirectory {
    /// Build the directory from the stored peer list. Loaded peers start
    /// offline with no `lastSeen`.
    pub fn load(store: Arc<Mutex<Database>>, events: EventSink) -> Result<Self, StoreError> {
        let known = lock(&store).load_known_peers()?;
        let peers = known
            .into_iter()
            .filter(PeerIdentity::is_valid)
            .map(|identity| (identity.user_id.clone(), Peer::offline(identity)))
            .collect();

        Ok(Self {
            peers,
            sockets: HashMap::new(),
            store,
            events,
        })
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Insert or merge a peer. Returns `true` if the peer was new.
    pub fn upsert(&mut self, identity: PeerIdentity, patch: PeerPatch) -> bool {
        let created = self.merge(identity, patch);
        self.changed();
        created
    }

    /// Merge a gossiped peer list received from `sender`.
    ///
    /// Entries for `me` are skipped. Every entry except the sender's own
    /// is attributed to the sender. Liveness is left untouched. Returns the
    /// addresses of merged peers that have no live socket.
    pub fn merge_gossip(
        &mut self,
        entries: &[PeerIdentity],
        sender: &PeerIdentity,
        me: &UserId,
    ) -> Vec<String> {
        let mut unconnected = Vec::new();
        for entry in entries {
            if &entry.user_id == me {
                continue;
            }
            let via = (entry.user_id != sender.user_id).then(|| sender.clone());
            self.merge(
                entry.clone(),
                PeerPatch {
                    discovered_via: via,
                    ..Default::default()
                },
            );
            if !self.has_live_socket(&entry.user_id) {
                unconnected.push(entry.ip.clone());
            }
        }
        if !entries.is_empty() {
            self.changed();
        }
        unconnected
    }

    fn merge(&mut self, identity: PeerIdentity, patch: PeerPatch) -> bool {
        let created = !self.peers.contains_key(&identity.user_id);
        let entry = self
            .peers
            .entry(identity.user_id.clone())
            .or_insert_with(|| Peer::offline(identity.clone()));

        entry.identity.name = identity.name;
        entry.identity.ip = identity.ip;
        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(ts) = patch.last_seen {
            entry.last_seen = Some(entry.last_seen.map_or(ts, |seen| seen.max(ts)));
        }
        if patch.discovered_via.is_some() {
            entry.discovered_via = patch.discovered_via;
        }

        if created {
            debug!(peer = %entry.identity.user_id, ip = %entry.identity.ip, "New peer");
        }
        created
    }

    /// No-op if the peer is unknown.
    pub fn mark_online(&mut self, user_id: &UserId, now: i64) -> bool {
        let Some(peer) = self.peers.get_mut(user_id) else {
            return false;
        };
        peer.status = PeerStatus::Online;
        peer.last_seen = Some(peer.last_seen.map_or(now, |seen| seen.max(now)));
        self.changed();
        true
    }

    /// No-op if the peer is unknown. `lastSeen` is kept.
    pub fn mark_offline(&mut self, user_id: &UserId) -> bool {
        let Some(peer) = self.peers.get_mut(user_id) else {
            return false;
        };
        if peer.status == PeerStatus::Offline {
            return false;
        }
        peer.status = PeerStatus::Offline;
        debug!(peer = %user_id, "Peer offline");
        self.changed();
        true
    }

    /// Flag offline peers at `addr` as being dialed.
    pub fn mark_connecting(&mut self, addr: &str) {
        self.move_status_at(addr, PeerStatus::Offline, PeerStatus::Connecting);
    }

    /// Undo [`mark_connecting`](Self::mark_connecting) for peers the dial
    /// did not bring online.
    pub fn clear_connecting(&mut self, addr: &str) {
        self.move_status_at(addr, PeerStatus::Connecting, PeerStatus::Offline);
    }

    fn move_status_at(&mut self, addr: &str, from: PeerStatus, to: PeerStatus) {
        let mut moved = false;
        for peer in self.peers.values_mut() {
            if peer.identity.ip == addr && peer.status == from {
                peer.status = to;
                moved = true;
            }
        }
        if moved {
            self.notify();
        }
    }

    /// Mark offline every online peer silent for more than `timeout_ms`.
    pub fn mark_stale_offline(&mut self, now: i64, timeout_ms: i64) -> Vec<UserId> {
        let mut stale = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.status == PeerStatus::Online && now - peer.last_seen.unwrap_or(0) > timeout_ms
            {
                peer.status = PeerStatus::Offline;
                stale.push(peer.identity.user_id.clone());
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Peers timed out");
            self.notify();
        }
        stale
    }

    pub fn peer(&self, user_id: &UserId) -> Option<&Peer> {
        self.peers.get(user_id)
    }

    pub fn peer_identity(&self, user_id: &UserId) -> Option<PeerIdentity> {
        self.peers.get(user_id).map(|p| p.identity.clone())
    }

    /// Every known identity, without liveness. Used when advertising this
    /// node's view.
    pub fn all_identities(&self) -> Vec<PeerIdentity> {
        let mut ids: Vec<_> = self.peers.values().map(|p| p.identity.clone()).collect();
        ids.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        ids
    }

    pub fn addresses_with_status(&self, status: PeerStatus) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.status == status)
            .map(|p| p.identity.ip.clone())
            .collect()
    }

    pub fn all_addresses(&self) -> Vec<String> {
        self.peers.values().map(|p| p.identity.ip.clone()).collect()
    }

    /// Sorted by display name (case-insensitive), then userId.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.identity
                .name
                .to_lowercase()
                .cmp(&b.identity.name.to_lowercase())
                .then_with(|| a.identity.user_id.cmp(&b.identity.user_id))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn changed(&self) {
        self.persist();
        self.notify();
    }

    fn persist(&self) {
        let identities = self.all_identities();
        if let Err(e) = lock(&self.store).save_known_peers(&identities) {
            warn!(error = %e, "Failed to persist known peers");
        }
    }

    fn notify(&self) {
        self.events.emit(NodeEvent::PeersUpdated(self.snapshot()));
    }

    // -----------------------------------------------------------------------
    // Socket registry
    // -----------------------------------------------------------------------

    /// Bind `conn` to `user_id`. A previous binding is replaced and left to
    /// close on its own.
    pub fn set_socket(&mut self, user_id: UserId, conn: PeerConnection) -> Option<PeerConnection> {
        debug!(peer = %user_id, conn = conn.id(), "Socket bound");
        self.sockets.insert(user_id, conn)
    }

    pub fn get_socket(&self, user_id: &UserId) -> Option<PeerConnection> {
        self.sockets.get(user_id).cloned()
    }

    pub fn has_live_socket(&self, user_id: &UserId) -> bool {
        self.sockets.get(user_id).is_some_and(PeerConnection::is_open)
    }

    /// Remove the binding that points at `conn`, returning its peer.
    pub fn remove_socket_by_conn(&mut self, conn: &PeerConnection) -> Option<UserId> {
        let user_id = self
            .sockets
            .iter()
            .find(|(_, bound)| *bound == conn)
            .map(|(uid, _)| uid.clone())?;
        self.sockets.remove(&user_id);
        Some(user_id)
    }

    /// Send a PEERS envelope with `list` to every live socket except the
    /// one bound to `except`. Returns the number of sockets reached.
    pub fn broadcast_peers(
        &self,
        list: &[PeerIdentity],
        from: &PeerIdentity,
        except: Option<&UserId>,
    ) -> usize {
        self.send_to_all(except, || {
            WsEnvelope::new(
                from.clone(),
                Frame::Peers(PeersPayload {
                    peers: list.to_vec(),
                }),
            )
        })
    }

    pub fn send_ping_to_all(&self, from: &PeerIdentity) -> usize {
        self.send_to_all(None, || WsEnvelope::new(from.clone(), Frame::Ping))
    }

    fn send_to_all(&self, except: Option<&UserId>, envelope: impl Fn() -> WsEnvelope) -> usize {
        let mut sent = 0;
        for (user_id, conn) in &self.sockets {
            if Some(user_id) == except || !conn.is_open() {
                continue;
            }
            match conn.send(&envelope()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %user_id, error = %e, "Broadcast send failed"),
            }
        }
        sent
    }

    /// Ask every bound connection to close.
    pub fn close_all(&self) {
        for conn in self.sockets.values() {
            conn.close();
        }
    }
}
