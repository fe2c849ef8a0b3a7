//! Frame handling shared by accepted and dialed connections.

use std::sync::Arc;

use tracing::{debug, info, warn};

use peerlink_shared::now_millis;
use peerlink_shared::protocol::{
    AckPayload, Frame, HelloAckPayload, HelloPayload, MsgPayload, PeersAckPayload, PeersPayload,
    WsEnvelope,
};
use peerlink_shared::types::PeerIdentity;
use peerlink_store::{Direction, StoredChatMessage};

use crate::client;
use crate::connection::PeerConnection;
use crate::context::{lock, NodeContext};
use crate::delivery;
use crate::directory::PeerPatch;
use crate::events::{NodeEvent, ReceivedMessage};

/// Which end of the connection this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Accepted by our listener; expects HELLO.
    Accepted,
    /// Opened by us; expects HELLO_ACK.
    Dialed,
}

/// Handle one text frame. Frames that fail to decode are dropped; they
/// never close the connection.
pub fn handle_text(ctx: &Arc<NodeContext>, conn: &PeerConnection, side: Side, text: &str) {
    match WsEnvelope::from_json(text) {
        Ok(envelope) => handle_envelope(ctx, conn, side, envelope),
        Err(e) => debug!(addr = conn.addr(), error = %e, "Dropping malformed frame"),
    }
}

pub fn handle_envelope(ctx: &Arc<NodeContext>, conn: &PeerConnection, side: Side, envelope: WsEnvelope) {
    let WsEnvelope {
        msg_id,
        ts,
        from,
        frame,
    } = envelope;

    match (frame, side) {
        (Frame::Hello(hello), Side::Accepted) => on_hello(ctx, conn, from, hello),
        (Frame::HelloAck(ack), Side::Dialed) => on_hello_ack(ctx, conn, from, ack),
        (Frame::Ping, _) => on_ping(ctx, conn),
        (Frame::Pong, _) => {
            lock(&ctx.directory).upsert(from, PeerPatch::online(now_millis()));
        }
        (Frame::Peers(payload), _) => on_peers(ctx, conn, from, payload),
        (Frame::PeersAck(ack), _) => {
            debug!(peer = %from.user_id, received = ack.received, "Peers acknowledged");
        }
        (Frame::Msg(payload), _) => on_msg(ctx, conn, msg_id, ts, from, payload),
        (Frame::Ack(ack), _) => {
            delivery::on_ack(ctx, &ack.ack_msg_id);
        }
        (frame, side) => {
            debug!(kind = ?frame.kind(), ?side, "Ignoring frame on this side of the connection");
        }
    }
}

/// Connection ended: release its binding and mark the peer offline if it
/// was still the peer's bound socket.
pub fn on_close(ctx: &NodeContext, conn: &PeerConnection) {
    let mut dir = lock(&ctx.directory);
    if let Some(user_id) = dir.remove_socket_by_conn(conn) {
        info!(peer = %user_id, addr = conn.addr(), "Peer disconnected");
        dir.mark_offline(&user_id);
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

fn on_hello(ctx: &Arc<NodeContext>, conn: &PeerConnection, from: PeerIdentity, hello: HelloPayload) {
    let Some(me) = ctx.local_identity() else {
        debug!(addr = conn.addr(), "Rejecting HELLO: no local profile");
        conn.close();
        return;
    };
    if from.user_id == me.user_id {
        warn!(addr = conn.addr(), "Rejecting HELLO from our own userId");
        conn.close();
        return;
    }

    info!(
        peer = %from.user_id,
        name = %from.name,
        app = %hello.app,
        version = %hello.version,
        "Peer connected (inbound)"
    );
    {
        let mut dir = lock(&ctx.directory);
        dir.upsert(from.clone(), PeerPatch::online(now_millis()));
        dir.set_socket(from.user_id.clone(), conn.clone());
    }

    reply(conn, &me, Frame::HelloAck(HelloAckPayload { accepted: true }));
    send_peer_view(ctx, conn, &me);
    delivery::flush_pending_to(ctx, &from.user_id);
}

fn on_hello_ack(ctx: &Arc<NodeContext>, conn: &PeerConnection, from: PeerIdentity, ack: HelloAckPayload) {
    if !ack.accepted {
        info!(peer = %from.user_id, "Handshake refused");
        conn.close();
        return;
    }
    let Some(me) = ctx.local_identity() else {
        conn.close();
        return;
    };
    if from.user_id == me.user_id {
        warn!(addr = conn.addr(), "Dialed our own node, closing");
        conn.close();
        return;
    }

    info!(peer = %from.user_id, name = %from.name, "Peer connected (outbound)");
    {
        let mut dir = lock(&ctx.directory);
        dir.set_socket(from.user_id.clone(), conn.clone());
        dir.upsert(from.clone(), PeerPatch::online(now_millis()));
    }

    send_peer_view(ctx, conn, &me);
    delivery::flush_pending_to(ctx, &from.user_id);
}

/// Push `[me, ...known]` to a freshly handshaken peer.
fn send_peer_view(ctx: &NodeContext, conn: &PeerConnection, me: &PeerIdentity) {
    let mut peers = vec![me.clone()];
    peers.extend(lock(&ctx.directory).all_identities());
    reply(conn, me, Frame::Peers(PeersPayload { peers }));
}

// ---------------------------------------------------------------------------
// Presence and gossip
// ---------------------------------------------------------------------------

fn on_ping(ctx: &NodeContext, conn: &PeerConnection) {
    if let Some(me) = ctx.local_identity() {
        reply(conn, &me, Frame::Pong);
    }
}

fn on_peers(ctx: &Arc<NodeContext>, conn: &PeerConnection, from: PeerIdentity, payload: PeersPayload) {
    let Some(me) = ctx.local_identity() else {
        return;
    };

    let to_dial = lock(&ctx.directory).merge_gossip(&payload.peers, &from, &me.user_id);
    for addr in to_dial {
        client::spawn_connect(ctx, &addr);
    }

    reply(
        conn,
        &me,
        Frame::PeersAck(PeersAckPayload {
            received: payload.peers.len(),
        }),
    );

    if ctx.first_gossip_sighting(&payload.peers) {
        let forwarded =
            lock(&ctx.directory).broadcast_peers(&payload.peers, &me, Some(&from.user_id));
        debug!(from = %from.user_id, peers = payload.peers.len(), forwarded, "Gossip forwarded");
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn on_msg(
    ctx: &NodeContext,
    conn: &PeerConnection,
    msg_id: String,
    ts: i64,
    from: PeerIdentity,
    payload: MsgPayload,
) {
    let Some(me) = ctx.local_identity() else {
        return;
    };
    lock(&ctx.directory).upsert(from.clone(), PeerPatch::online(now_millis()));

    let ack = Frame::Ack(AckPayload {
        ack_msg_id: msg_id.clone(),
    });

    if payload.is_dm_for_other(&me.user_id) {
        debug!(msg_id = %msg_id, from = %from.user_id, "DM addressed to another node, not surfacing");
        reply(conn, &me, ack);
        return;
    }

    if ctx.mark_msg_seen(&msg_id) {
        let stored = StoredChatMessage {
            msg_id: msg_id.clone(),
            ts,
            from: from.clone(),
            payload: payload.clone(),
            direction: Direction::In,
        };
        if let Err(e) = lock(&ctx.db).append_chat_message(&stored) {
            warn!(msg_id = %msg_id, error = %e, "Failed to store received message");
        }
        debug!(msg_id = %msg_id, from = %from.user_id, "Message received");
        ctx.events.emit(NodeEvent::MessageReceived(ReceivedMessage {
            msg_id,
            from,
            ts,
            payload,
        }));
    } else {
        debug!(msg_id = %msg_id, "Duplicate message, re-acknowledging");
    }

    reply(conn, &me, ack);
}

fn reply(conn: &PeerConnection, me: &PeerIdentity, frame: Frame) {
    let envelope = WsEnvelope::new(me.clone(), frame);
    if let Err(e) = conn.send(&envelope) {
        debug!(addr = conn.addr(), kind = ?envelope.kind(), error = %e, "Reply not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::connection::Outgoing;
    use peerlink_shared::protocol::FrameType;
    use peerlink_shared::types::{PeerStatus, Profile, UserId};
    use peerlink_store::{Database, ProfileInput};
    use tokio::sync::mpsc;

    fn registered() -> (Arc<NodeContext>, Profile) {
        let db = Database::open_in_memory().unwrap();
        let profile = db
            .save_profile(&ProfileInput {
                name: "Bob".into(),
                email: "bob@example.com".into(),
                ip: "10.0.0.2".into(),
            })
            .unwrap();
        (NodeContext::new(NodeConfig::default(), db).unwrap(), profile)
    }

    fn alice() -> PeerIdentity {
        PeerIdentity::new("a", "Alice", "10.0.0.1")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Option<WsEnvelope>> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(match item {
                Outgoing::Text(text) => Some(WsEnvelope::from_json(&text).unwrap()),
                Outgoing::Close => None,
            });
        }
        out
    }

    fn kinds(frames: &[Option<WsEnvelope>]) -> Vec<Option<FrameType>> {
        frames.iter().map(|f| f.as_ref().map(WsEnvelope::kind)).collect()
    }

    fn msg_envelope(msg_id: &str, payload: MsgPayload) -> WsEnvelope {
        WsEnvelope {
            msg_id: msg_id.into(),
            ts: 42,
            from: alice(),
            frame: Frame::Msg(payload),
        }
    }

    #[tokio::test]
    async fn test_hello_handshake() {
        let (ctx, profile) = registered();
        let (conn, mut rx) = PeerConnection::new("10.0.0.1:50000");

        handle_envelope(
            &ctx,
            &conn,
            Side::Accepted,
            WsEnvelope::new(alice(), Frame::Hello(HelloPayload::default())),
        );

        let frames = drain(&mut rx);
        assert_eq!(
            kinds(&frames),
            vec![Some(FrameType::HelloAck), Some(FrameType::Peers)]
        );
        let Some(Frame::Peers(view)) = frames[1].as_ref().map(|e| e.frame.clone()) else {
            panic!("expected PEERS");
        };
        assert_eq!(view.peers[0], profile.identity());
        assert!(view.peers.contains(&alice()));

        let dir = lock(&ctx.directory);
        let peer = dir.peer(&UserId::from("a")).unwrap();
        assert_eq!(peer.status, PeerStatus::Online);
        assert!(peer.last_seen.is_some());
        assert_eq!(dir.get_socket(&UserId::from("a")), Some(conn));
    }

    #[tokio::test]
    async fn test_hello_without_profile_closes() {
        let ctx = NodeContext::new(NodeConfig::default(), Database::open_in_memory().unwrap())
            .unwrap();
        let (conn, mut rx) = PeerConnection::new("10.0.0.1:50000");

        handle_text(
            &ctx,
            &conn,
            Side::Accepted,
            &WsEnvelope::new(alice(), Frame::Hello(HelloPayload::default()))
                .to_json()
                .unwrap(),
        );

        assert_eq!(kinds(&drain(&mut rx)), vec![None]);
        assert!(lock(&ctx.directory).is_empty());
    }

    #[tokio::test]
    async fn test_hello_ignored_on_dialed_side() {
        let (ctx, _) = registered();
        let (conn, mut rx) = PeerConnection::new("10.0.0.1");

        handle_envelope(
            &ctx,
            &conn,
            Side::Dialed,
            WsEnvelope::new(alice(), Frame::Hello(HelloPayload::default())),
        );

        assert!(drain(&mut rx).is_empty());
        assert!(lock(&ctx.directory).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_msg_acked_twice_surfaced_once() {
        let (ctx, profile) = registered();
        let (conn, mut rx) = PeerConnection::new("10.0.0.1");
        let mut events = ctx.events.subscribe();
        let env = msg_envelope("m1", MsgPayload::direct(profile.user_id.clone(), "hi"));

        handle_envelope(&ctx, &conn, Side::Accepted, env.clone());
        handle_envelope(&ctx, &conn, Side::Accepted, env);

        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames), vec![Some(FrameType::Ack), Some(FrameType::Ack)]);
        for frame in frames.into_iter().flatten() {
            assert_eq!(
                frame.frame,
                Frame::Ack(AckPayload {
                    ack_msg_id: "m1".into()
                })
            );
        }

        let mut received = 0;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::MessageReceived(msg) = event {
                assert_eq!(msg.msg_id, "m1");
                assert_eq!(msg.ts, 42);
                received += 1;
            }
        }
        assert_eq!(received, 1);

        let history = lock(&ctx.db).load_chat_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::In);
    }

    #[tokio::test]
    async fn test_dm_for_other_node_is_acked_not_surfaced() {
        let (ctx, _) = registered();
        let (conn, mut rx) = PeerConnection::new("10.0.0.1");
        let mut events = ctx.events.subscribe();

        handle_envelope(
            &ctx,
            &conn,
            Side::Dialed,
            msg_envelope("m1", MsgPayload::direct(UserId::from("someone-else"), "psst")),
        );

        assert_eq!(kinds(&drain(&mut rx)), vec![Some(FrameType::Ack)]);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, NodeEvent::MessageReceived(_)));
        }
        assert!(lock(&ctx.db).load_chat_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peers_records_provenance_and_forwards_once() {
        let (ctx, profile) = registered();
        let (from_alice, mut alice_rx) = PeerConnection::new("10.0.0.1");
        let (to_dave, mut dave_rx) = PeerConnection::new("10.0.0.4");
        {
            let mut dir = lock(&ctx.directory);
            dir.upsert(alice(), PeerPatch::online(1));
            dir.set_socket(UserId::from("a"), from_alice.clone());
            dir.upsert(PeerIdentity::new("d", "Dave", "10.0.0.4"), PeerPatch::online(1));
            dir.set_socket(UserId::from("d"), to_dave);
        }

        let carol = PeerIdentity::new("c", "Carol", "127.0.0.1:1");
        let gossip = WsEnvelope::new(
            alice(),
            Frame::Peers(PeersPayload {
                peers: vec![alice(), profile.identity(), carol.clone()],
            }),
        );
        handle_envelope(&ctx, &from_alice, Side::Accepted, gossip.clone());
        handle_envelope(&ctx, &from_alice, Side::Accepted, gossip);

        {
            let dir = lock(&ctx.directory);
            let entry = dir.peer(&UserId::from("c")).unwrap();
            assert_eq!(entry.discovered_via, Some(alice()));
            assert_eq!(entry.last_seen, None);
            assert_eq!(dir.peer(&UserId::from("a")).unwrap().discovered_via, None);
            assert!(dir.peer(&profile.user_id).is_none());
        }

        let replies = drain(&mut alice_rx);
        assert_eq!(
            kinds(&replies),
            vec![Some(FrameType::PeersAck), Some(FrameType::PeersAck)]
        );
        assert_eq!(
            replies[0].as_ref().unwrap().frame,
            Frame::PeersAck(PeersAckPayload { received: 3 })
        );
        assert_eq!(kinds(&drain(&mut dave_rx)), vec![Some(FrameType::Peers)]);
    }

    fn peers_listing(frames: &[Option<WsEnvelope>], uid: &UserId) -> usize {
        frames
            .iter()
            .flatten()
            .filter(|env| match &env.frame {
                Frame::Peers(view) => view.peers.iter().any(|p| &p.user_id == uid),
                _ => false,
            })
            .count()
    }

    #[tokio::test]
    async fn test_newcomer_view_reaches_other_sockets() {
        let (ctx, profile) = registered();
        let carol = PeerIdentity::new("c", "Carol", "10.0.0.3");
        let dave = PeerIdentity::new("d", "Dave", "10.0.0.4");
        let (to_alice, mut alice_rx) = PeerConnection::new("10.0.0.1");
        let (to_carol, mut carol_rx) = PeerConnection::new("10.0.0.3");
        {
            let mut dir = lock(&ctx.directory);
            dir.upsert(alice(), PeerPatch::online(1));
            dir.set_socket(UserId::from("a"), to_alice);
            dir.upsert(carol.clone(), PeerPatch::online(1));
            dir.set_socket(UserId::from("c"), to_carol);
        }

        let (from_dave, mut dave_rx) = PeerConnection::new("10.0.0.4:50000");
        handle_envelope(
            &ctx,
            &from_dave,
            Side::Accepted,
            WsEnvelope::new(dave.clone(), Frame::Hello(HelloPayload::default())),
        );
        // Dave answers with the same set he was just handed.
        handle_envelope(
            &ctx,
            &from_dave,
            Side::Accepted,
            WsEnvelope::new(
                dave.clone(),
                Frame::Peers(PeersPayload {
                    peers: vec![dave.clone(), profile.identity(), alice(), carol],
                }),
            ),
        );

        assert_eq!(peers_listing(&drain(&mut alice_rx), &dave.user_id), 1);
        assert_eq!(peers_listing(&drain(&mut carol_rx), &dave.user_id), 1);
        assert_eq!(
            kinds(&drain(&mut dave_rx)),
            vec![
                Some(FrameType::HelloAck),
                Some(FrameType::Peers),
                Some(FrameType::PeersAck)
            ]
        );
    }

    #[tokio::test]
    async fn test_close_only_marks_bound_socket_offline() {
        let (ctx, _) = registered();
        let (old, _old_rx) = PeerConnection::new("10.0.0.1");
        let (new, _new_rx) = PeerConnection::new("10.0.0.1");
        {
            let mut dir = lock(&ctx.directory);
            dir.upsert(alice(), PeerPatch::online(1));
            dir.set_socket(UserId::from("a"), old.clone());
            dir.set_socket(UserId::from("a"), new.clone());
        }

        on_close(&ctx, &old);
        assert_eq!(
            lock(&ctx.directory).peer(&UserId::from("a")).unwrap().status,
            PeerStatus::Online
        );

        on_close(&ctx, &new);
        assert_eq!(
            lock(&ctx.directory).peer(&UserId::from("a")).unwrap().status,
            PeerStatus::Offline
        );
    }
}
