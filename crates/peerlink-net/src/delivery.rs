//! Reliable delivery: durable outbox, retry loop and ACK correlation.
//!
//! Every outbound chat message becomes a [`PendingOutboxMessage`] that is
//! written to the database before the first send attempt and removed
//! only when the recipient ACKs it or the attempt budget runs out. The
//! in-memory [`Outbox`] mirrors the table; both are updated under the
//! outbox lock so a late send attempt can never resurrect an ACKed row.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use peerlink_shared::protocol::{Frame, MsgPayload, WsEnvelope};
use peerlink_shared::types::{PeerIdentity, UserId};
use peerlink_shared::{new_id, now_millis};
use peerlink_store::{Direction, PendingOutboxMessage, StoredChatMessage};

use crate::client;
use crate::connection::PeerConnection;
use crate::context::{lock, NodeContext};
use crate::error::{NetError, Result};
use crate::events::{DeliveryStatus, DeliveryUpdate, NodeEvent};

/// ACK count of one PUBLIC send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupProgress {
    pub total: usize,
    pub delivered: usize,
}

// ---------------------------------------------------------------------------
// In-memory outbox
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Outbox {
    pending: HashMap<String, PendingOutboxMessage>,
    groups: HashMap<String, GroupProgress>,
}

impl Outbox {
    pub fn from_records(records: Vec<PendingOutboxMessage>) -> Self {
        Self {
            pending: records
                .into_iter()
                .map(|m| (m.msg_id.clone(), m))
                .collect(),
            groups: HashMap::new(),
        }
    }

    pub fn insert(&mut self, msg: PendingOutboxMessage) {
        self.pending.insert(msg.msg_id.clone(), msg);
    }

    pub fn get(&self, msg_id: &str) -> Option<&PendingOutboxMessage> {
        self.pending.get(msg_id)
    }

    pub fn get_mut(&mut self, msg_id: &str) -> Option<&mut PendingOutboxMessage> {
        self.pending.get_mut(msg_id)
    }

    pub fn remove(&mut self, msg_id: &str) -> Option<PendingOutboxMessage> {
        self.pending.remove(msg_id)
    }

    /// All pending messages, oldest first.
    pub fn pending(&self) -> Vec<PendingOutboxMessage> {
        let mut all: Vec<_> = self.pending.values().cloned().collect();
        all.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.msg_id.cmp(&b.msg_id)));
        all
    }

    /// msgIds addressed to `user_id`, oldest first.
    pub fn ids_for(&self, user_id: &UserId) -> Vec<String> {
        let mut ids: Vec<_> = self
            .pending
            .values()
            .filter(|m| &m.to_user_id == user_id)
            .map(|m| (m.ts, m.msg_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn start_group(&mut self, group_id: &str, total: usize) -> GroupProgress {
        let progress = GroupProgress {
            total,
            delivered: 0,
        };
        self.groups.insert(group_id.to_string(), progress);
        progress
    }

    /// Count one ACK for `group_id`. Never exceeds the group total.
    pub fn record_group_delivery(&mut self, group_id: &str) -> Option<GroupProgress> {
        let progress = self.groups.get_mut(group_id)?;
        progress.delivered = (progress.delivered + 1).min(progress.total);
        Some(*progress)
    }

    pub fn group(&self, group_id: &str) -> Option<GroupProgress> {
        self.groups.get(group_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

/// Queue a direct message to `to` and start delivering it.
pub fn send_dm(ctx: &Arc<NodeContext>, to: &UserId, text: &str) -> Result<String> {
    let me = ctx.local_identity().ok_or(NetError::NotRegistered)?;
    let target = lock(&ctx.directory)
        .peer_identity(to)
        .ok_or_else(|| NetError::UnknownPeer(to.clone()))?;

    let msg_id = new_id();
    let payload = MsgPayload::direct(to.clone(), text);
    record_outgoing(ctx, &me, &msg_id, &payload);
    enqueue(ctx, &me, &target, msg_id.clone(), payload, None);
    Ok(msg_id)
}

/// Fan a message out to every known peer. Returns the groupId.
pub fn send_public(ctx: &Arc<NodeContext>, text: &str) -> Result<String> {
    let me = ctx.local_identity().ok_or(NetError::NotRegistered)?;
    let recipients: Vec<PeerIdentity> = lock(&ctx.directory)
        .all_identities()
        .into_iter()
        .filter(|p| p.user_id != me.user_id)
        .collect();

    let group_id = new_id();
    let progress = lock(&ctx.outbox).start_group(&group_id, recipients.len());
    info!(group_id = %group_id, recipients = recipients.len(), "Public message queued");
    ctx.events.emit(NodeEvent::DeliveryStatus(group_update(
        &group_id,
        DeliveryStatus::Queued,
        progress,
    )));

    let payload = MsgPayload::public(group_id.clone(), text);
    record_outgoing(ctx, &me, &group_id, &payload);
    if recipients.is_empty() {
        ctx.events.emit(NodeEvent::DeliveryStatus(group_update(
            &group_id,
            DeliveryStatus::Delivered,
            progress,
        )));
        return Ok(group_id);
    }
    for recipient in &recipients {
        enqueue(
            ctx,
            &me,
            recipient,
            new_id(),
            payload.clone(),
            Some(group_id.clone()),
        );
    }
    Ok(group_id)
}

fn enqueue(
    ctx: &Arc<NodeContext>,
    me: &PeerIdentity,
    target: &PeerIdentity,
    msg_id: String,
    payload: MsgPayload,
    group_id: Option<String>,
) {
    let record = PendingOutboxMessage {
        msg_id: msg_id.clone(),
        ts: now_millis(),
        to_user_id: target.user_id.clone(),
        to_ip: target.ip.clone(),
        from: me.clone(),
        payload,
        group_id,
        attempts: 0,
        last_attempt_at: None,
    };
    let queued = status_update(&record, DeliveryStatus::Queued);

    {
        let mut outbox = lock(&ctx.outbox);
        persist(ctx, &record);
        outbox.insert(record);
    }
    debug!(msg_id = %msg_id, to = %target.user_id, "Message queued");
    ctx.events.emit(NodeEvent::DeliveryStatus(queued));

    if !lock(&ctx.directory).has_live_socket(&target.user_id) {
        client::spawn_connect(ctx, &target.ip);
    }
    try_send_pending(ctx, &msg_id);

    for delay in &ctx.config.early_retry_delays {
        let ctx = Arc::clone(ctx);
        let msg_id = msg_id.clone();
        let delay = *delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            try_send_pending(&ctx, &msg_id);
        });
    }
}

/// Send one attempt of a pending message over the recipient's live
/// socket. Does nothing (and counts no attempt) without one.
///
/// The frame is queued under the outbox lock, so a message settled or
/// given up on by another task is never sent afterwards.
pub fn try_send_pending(ctx: &NodeContext, msg_id: &str) -> bool {
    let Some(to_user_id) = lock(&ctx.outbox).get(msg_id).map(|m| m.to_user_id.clone()) else {
        return false;
    };
    let Some(conn) = lock(&ctx.directory)
        .get_socket(&to_user_id)
        .filter(PeerConnection::is_open)
    else {
        return false;
    };

    let updated = {
        let mut outbox = lock(&ctx.outbox);
        let Some(entry) = outbox.get_mut(msg_id) else {
            return false;
        };
        let envelope = WsEnvelope {
            msg_id: entry.msg_id.clone(),
            ts: entry.ts,
            from: entry.from.clone(),
            frame: Frame::Msg(entry.payload.clone()),
        };
        if let Err(e) = conn.send(&envelope) {
            debug!(msg_id = %msg_id, error = %e, "Send attempt failed");
            return false;
        }
        entry.attempts += 1;
        entry.last_attempt_at = Some(now_millis());
        let updated = entry.clone();
        persist(ctx, &updated);
        updated
    };

    debug!(
        msg_id = %msg_id,
        to = %updated.to_user_id,
        attempts = updated.attempts,
        "Message sent"
    );
    ctx.events.emit(NodeEvent::DeliveryStatus(status_update(
        &updated,
        DeliveryStatus::Sent,
    )));
    true
}

/// Retry everything addressed to a peer that just (re)connected.
pub fn flush_pending_to(ctx: &NodeContext, user_id: &UserId) {
    let ids = lock(&ctx.outbox).ids_for(user_id);
    if !ids.is_empty() {
        debug!(peer = %user_id, count = ids.len(), "Flushing pending messages");
    }
    for msg_id in ids {
        try_send_pending(ctx, &msg_id);
    }
}

// ---------------------------------------------------------------------------
// Acknowledgement and retry
// ---------------------------------------------------------------------------

/// Settle a pending message. Returns `false` if `ack_msg_id` is not (or
/// no longer) pending, in which case nothing is emitted.
pub fn on_ack(ctx: &NodeContext, ack_msg_id: &str) -> bool {
    let (record, group) = {
        let mut outbox = lock(&ctx.outbox);
        let Some(record) = outbox.remove(ack_msg_id) else {
            return false;
        };
        unpersist(ctx, ack_msg_id);
        let group = record.group_id.as_deref().and_then(|group_id| {
            outbox
                .record_group_delivery(group_id)
                .map(|progress| (group_id.to_string(), progress))
        });
        (record, group)
    };

    info!(
        msg_id = %ack_msg_id,
        to = %record.to_user_id,
        attempts = record.attempts,
        "Message delivered"
    );
    ctx.events.emit(NodeEvent::DeliveryStatus(status_update(
        &record,
        DeliveryStatus::Delivered,
    )));

    if let Some((group_id, progress)) = group {
        let status = if progress.delivered >= progress.total {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };
        ctx.events.emit(NodeEvent::DeliveryStatus(group_update(&group_id, status, progress)));
    }
    true
}

/// One pass of the retry loop: drop messages that used up their
/// attempts, resend those whose last attempt is older than the interval.
pub fn retry_tick(ctx: &NodeContext) {
    let now = now_millis();
    let interval_ms = ctx.config.retry_interval.as_millis() as i64;
    let max_attempts = ctx.config.max_attempts;

    let (exhausted, due) = {
        let mut outbox = lock(&ctx.outbox);
        let (exhausted, waiting): (Vec<_>, Vec<_>) = outbox
            .pending()
            .into_iter()
            .partition(|m| m.attempts >= max_attempts);
        for record in &exhausted {
            outbox.remove(&record.msg_id);
            unpersist(ctx, &record.msg_id);
        }
        let due: Vec<String> = waiting
            .into_iter()
            .filter(|m| now - m.last_attempt_at.unwrap_or(0) > interval_ms)
            .map(|m| m.msg_id)
            .collect();
        (exhausted, due)
    };

    for record in exhausted {
        warn!(
            msg_id = %record.msg_id,
            to = %record.to_user_id,
            attempts = record.attempts,
            "Delivery failed, giving up"
        );
        ctx.events.emit(NodeEvent::DeliveryStatus(status_update(
            &record,
            DeliveryStatus::Failed,
        )));
    }
    for msg_id in due {
        try_send_pending(ctx, &msg_id);
    }
}

pub async fn retry_loop(ctx: Arc<NodeContext>) {
    let period = ctx.config.retry_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        retry_tick(&ctx);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Per-recipient status, keyed by groupId for PUBLIC copies.
fn status_update(record: &PendingOutboxMessage, status: DeliveryStatus) -> DeliveryUpdate {
    DeliveryUpdate {
        key: record
            .group_id
            .clone()
            .unwrap_or_else(|| record.msg_id.clone()),
        msg_id: Some(record.msg_id.clone()),
        to_user_id: Some(record.to_user_id.clone()),
        status,
        progress: None,
    }
}

/// Aggregate status of a PUBLIC send.
fn group_update(group_id: &str, status: DeliveryStatus, progress: GroupProgress) -> DeliveryUpdate {
    DeliveryUpdate {
        key: group_id.to_string(),
        msg_id: None,
        to_user_id: None,
        status,
        progress: Some(progress),
    }
}

fn persist(ctx: &NodeContext, record: &PendingOutboxMessage) {
    if let Err(e) = lock(&ctx.db).upsert_outbox(record) {
        warn!(msg_id = %record.msg_id, error = %e, "Failed to persist outbox entry");
    }
}

fn unpersist(ctx: &NodeContext, msg_id: &str) {
    if let Err(e) = lock(&ctx.db).remove_outbox(msg_id) {
        warn!(msg_id = %msg_id, error = %e, "Failed to remove outbox entry");
    }
}

fn record_outgoing(ctx: &NodeContext, me: &PeerIdentity, msg_id: &str, payload: &MsgPayload) {
    let entry = StoredChatMessage {
        msg_id: msg_id.to_string(),
        ts: now_millis(),
        from: me.clone(),
        payload: payload.clone(),
        direction: Direction::Out,
    };
    if let Err(e) = lock(&ctx.db).append_chat_message(&entry) {
        warn!(msg_id = %msg_id, error = %e, "Failed to store outgoing message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::connection::Outgoing;
    use crate::directory::PeerPatch;
    use peerlink_store::{Database, ProfileInput};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    fn context(config: NodeConfig) -> Arc<NodeContext> {
        let db = Database::open_in_memory().unwrap();
        db.save_profile(&ProfileInput {
            name: "Alice".into(),
            email: "alice@example.com".into(),
            ip: "10.0.0.1".into(),
        })
        .unwrap();
        NodeContext::new(config, db).unwrap()
    }

    /// Add a peer with a fake live socket; returns the socket's frame queue.
    fn connected_peer(ctx: &NodeContext, uid: &str) -> mpsc::UnboundedReceiver<Outgoing> {
        let identity = PeerIdentity::new(uid, uid.to_uppercase(), format!("10.0.1.{}", uid.len()));
        let (conn, rx) = PeerConnection::new(identity.ip.clone());
        let mut dir = lock(&ctx.directory);
        dir.upsert(identity.clone(), PeerPatch::online(now_millis()));
        dir.set_socket(identity.user_id, conn);
        rx
    }

    fn sent_msg_ids(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(Outgoing::Text(text)) = rx.try_recv() {
            let env = WsEnvelope::from_json(&text).unwrap();
            assert!(matches!(env.frame, Frame::Msg(_)));
            ids.push(env.msg_id);
        }
        ids
    }

    fn statuses(rx: &mut broadcast::Receiver<NodeEvent>) -> Vec<DeliveryUpdate> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let NodeEvent::DeliveryStatus(update) = event {
                out.push(update);
            }
        }
        out
    }

    #[test]
    fn test_group_progress_is_capped() {
        let mut outbox = Outbox::default();
        outbox.start_group("g", 2);
        assert_eq!(outbox.record_group_delivery("g").unwrap().delivered, 1);
        assert_eq!(outbox.record_group_delivery("g").unwrap().delivered, 2);
        assert_eq!(outbox.record_group_delivery("g").unwrap().delivered, 2);
        assert!(outbox.record_group_delivery("missing").is_none());
    }

    #[tokio::test]
    async fn test_send_dm_unknown_peer() {
        let ctx = context(NodeConfig::default());
        let err = send_dm(&ctx, &UserId::from("nobody"), "hi").unwrap_err();
        assert!(matches!(err, NetError::UnknownPeer(_)));
        assert!(lock(&ctx.outbox).is_empty());
        assert!(lock(&ctx.db).load_outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_dm_requires_profile() {
        let ctx = NodeContext::new(NodeConfig::default(), Database::open_in_memory().unwrap())
            .unwrap();
        let err = send_dm(&ctx, &UserId::from("b"), "hi").unwrap_err();
        assert!(matches!(err, NetError::NotRegistered));
    }

    #[tokio::test]
    async fn test_send_dm_then_ack() {
        let ctx = context(NodeConfig::default());
        let mut frames = connected_peer(&ctx, "b");
        let mut events = ctx.events.subscribe();

        let msg_id = send_dm(&ctx, &UserId::from("b"), "hi").unwrap();

        assert_eq!(sent_msg_ids(&mut frames), vec![msg_id.clone()]);
        let stored = lock(&ctx.db).load_outbox().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].attempts, 1);
        assert!(stored[0].last_attempt_at.is_some());

        assert!(on_ack(&ctx, &msg_id));
        assert!(!on_ack(&ctx, &msg_id));
        assert!(lock(&ctx.outbox).is_empty());
        assert!(lock(&ctx.db).load_outbox().unwrap().is_empty());

        let seen: Vec<_> = statuses(&mut events).into_iter().map(|u| u.status).collect();
        assert_eq!(
            seen,
            vec![
                DeliveryStatus::Queued,
                DeliveryStatus::Sent,
                DeliveryStatus::Delivered
            ]
        );

        let history = lock(&ctx.db).load_chat_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::Out);
    }

    #[tokio::test]
    async fn test_no_socket_counts_no_attempt() {
        let ctx = context(NodeConfig::default());
        lock(&ctx.directory).upsert(
            PeerIdentity::new("b", "Bob", "127.0.0.1:1"),
            PeerPatch::default(),
        );

        let msg_id = send_dm(&ctx, &UserId::from("b"), "hi").unwrap();
        assert!(!try_send_pending(&ctx, &msg_id));

        let pending = lock(&ctx.outbox).pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let config = NodeConfig {
            max_attempts: 3,
            early_retry_delays: Vec::new(),
            ..NodeConfig::default()
        };
        let ctx = context(config);
        let mut frames = connected_peer(&ctx, "b");
        let mut events = ctx.events.subscribe();

        let msg_id = send_dm(&ctx, &UserId::from("b"), "hi").unwrap();
        for _ in 0..5 {
            if let Some(entry) = lock(&ctx.outbox).get_mut(&msg_id) {
                entry.last_attempt_at = Some(0);
            }
            retry_tick(&ctx);
        }

        assert_eq!(sent_msg_ids(&mut frames).len(), 3);
        assert!(lock(&ctx.outbox).is_empty());
        assert!(lock(&ctx.db).load_outbox().unwrap().is_empty());

        let failed: Vec<_> = statuses(&mut events)
            .into_iter()
            .filter(|u| u.status == DeliveryStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, msg_id);
    }

    #[tokio::test]
    async fn test_public_group_progress() {
        let ctx = context(NodeConfig::default());
        let mut to_b = connected_peer(&ctx, "b");
        let mut to_c = connected_peer(&ctx, "cc");
        let mut events = ctx.events.subscribe();

        let group_id = send_public(&ctx, "hello all").unwrap();
        let b_ids = sent_msg_ids(&mut to_b);
        let c_ids = sent_msg_ids(&mut to_c);
        assert_eq!((b_ids.len(), c_ids.len()), (1, 1));
        assert_eq!(
            lock(&ctx.outbox).group(&group_id),
            Some(GroupProgress {
                total: 2,
                delivered: 0
            })
        );

        on_ack(&ctx, &b_ids[0]);
        on_ack(&ctx, &b_ids[0]);
        assert_eq!(lock(&ctx.outbox).group(&group_id).unwrap().delivered, 1);
        on_ack(&ctx, &c_ids[0]);

        let aggregates: Vec<_> = statuses(&mut events)
            .into_iter()
            .filter(|u| u.progress.is_some())
            .collect();
        assert!(aggregates.iter().all(|u| u.key == group_id));
        let progress: Vec<_> = aggregates
            .iter()
            .map(|u| (u.status, u.progress.unwrap().delivered))
            .collect();
        assert_eq!(
            progress,
            vec![
                (DeliveryStatus::Queued, 0),
                (DeliveryStatus::Sent, 1),
                (DeliveryStatus::Delivered, 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_public_send_without_recipients_completes() {
        let ctx = context(NodeConfig::default());
        let mut events = ctx.events.subscribe();

        let group_id = send_public(&ctx, "anyone?").unwrap();

        let progress = GroupProgress {
            total: 0,
            delivered: 0,
        };
        assert_eq!(lock(&ctx.outbox).group(&group_id), Some(progress));
        assert!(lock(&ctx.outbox).is_empty());
        let seen: Vec<_> = statuses(&mut events)
            .into_iter()
            .map(|u| (u.key, u.status, u.progress))
            .collect();
        assert_eq!(
            seen,
            vec![
                (group_id.clone(), DeliveryStatus::Queued, Some(progress)),
                (group_id, DeliveryStatus::Delivered, Some(progress))
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_message_is_not_sent_again() {
        let config = NodeConfig {
            max_attempts: 1,
            early_retry_delays: Vec::new(),
            ..NodeConfig::default()
        };
        let ctx = context(config);
        let mut frames = connected_peer(&ctx, "b");

        let msg_id = send_dm(&ctx, &UserId::from("b"), "hi").unwrap();
        assert_eq!(sent_msg_ids(&mut frames), vec![msg_id.clone()]);

        retry_tick(&ctx);
        assert!(lock(&ctx.outbox).is_empty());

        assert!(!try_send_pending(&ctx, &msg_id));
        flush_pending_to(&ctx, &UserId::from("b"));
        assert!(sent_msg_ids(&mut frames).is_empty());
    }

    #[tokio::test]
    async fn test_early_retries_catch_late_handshake() {
        let ctx = context(NodeConfig::default());
        // Nothing listens here, so the background dial fails fast.
        lock(&ctx.directory).upsert(
            PeerIdentity::new("b", "Bob", "127.0.0.1:1"),
            PeerPatch::default(),
        );

        let msg_id = send_dm(&ctx, &UserId::from("b"), "hi").unwrap();
        assert_eq!(lock(&ctx.outbox).get(&msg_id).unwrap().attempts, 0);

        // The handshake completes before the first early retry.
        let (conn, mut frames) = PeerConnection::new("127.0.0.1:1");
        lock(&ctx.directory).set_socket(UserId::from("b"), conn);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(sent_msg_ids(&mut frames), vec![msg_id.clone()]);
        assert_eq!(lock(&ctx.outbox).get(&msg_id).unwrap().attempts, 1);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(sent_msg_ids(&mut frames), vec![msg_id.clone()]);
        assert_eq!(lock(&ctx.outbox).get(&msg_id).unwrap().attempts, 2);
    }
}
