//! Presence timers: heartbeat, offline sweep, reconnect sweep and
//! resume-from-suspend detection.
//!
//! Each runs as its own task on a fixed tick. Dial failures are left to
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use peerlink_shared::now_millis;
use peerlink_shared::types::{PeerStatus, UserId};

use crate::client;
use crate::context::{lock, NodeContext};

pub fn spawn_all(ctx: &Arc<NodeContext>) -> Vec<JoinHandle<()>> {
    let config = &ctx.config;
    vec![
        every(ctx, config.heartbeat_interval, |ctx| {
            heartbeat(ctx);
        }),
        every(ctx, config.offline_sweep_interval, |ctx| {
            sweep_offline(ctx);
        }),
        every(ctx, config.reconnect_interval, reconnect_offline),
        tokio::spawn(resume_watch(Arc::clone(ctx))),
    ]
}

fn every(
    ctx: &Arc<NodeContext>,
    period: Duration,
    action: fn(&Arc<NodeContext>),
) -> JoinHandle<()> {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            action(&ctx);
        }
    })
}

/// PING every live socket. Skipped while unregistered.
pub fn heartbeat(ctx: &NodeContext) -> usize {
    let Some(me) = ctx.local_identity() else {
        return 0;
    };
    lock(&ctx.directory).send_ping_to_all(&me)
}

pub fn sweep_offline(ctx: &NodeContext) -> Vec<UserId> {
    let timeout_ms = ctx.config.offline_timeout.as_millis() as i64;
    lock(&ctx.directory).mark_stale_offline(now_millis(), timeout_ms)
}

pub fn reconnect_offline(ctx: &Arc<NodeContext>) {
    let addrs = lock(&ctx.directory).addresses_with_status(PeerStatus::Offline);
    dial_all(ctx, addrs);
}

/// Dial every known peer, e.g. after the host wakes up.
pub fn reconnect_all(ctx: &Arc<NodeContext>) {
    let addrs = lock(&ctx.directory).all_addresses();
    dial_all(ctx, addrs);
}

fn dial_all(ctx: &Arc<NodeContext>, mut addrs: Vec<String>) {
    if ctx.local_identity().is_none() {
        return;
    }
    addrs.sort();
    addrs.dedup();
    if !addrs.is_empty() {
        debug!(count = addrs.len(), "Reconnecting");
    }
    for addr in addrs {
        client::spawn_connect(ctx, &addr);
    }
}

/// Compares wall-clock and monotonic progress between checks. The wall
/// clock keeps running while the host sleeps; the monotonic clock does not.
#[derive(Debug)]
struct ResumeDetector {
    threshold_ms: i64,
    last_wall: i64,
    last_mono: std::time::Instant,
}

impl ResumeDetector {
    fn new(threshold_ms: i64, wall: i64, mono: std::time::Instant) -> Self {
        Self {
            threshold_ms,
            last_wall: wall,
            last_mono: mono,
        }
    }

    /// Record a check. Returns the jump in ms if the wall clock ran ahead
    /// by more than the threshold since the previous one.
    fn observe(&mut self, wall: i64, mono: std::time::Instant) -> Option<i64> {
        let wall_elapsed = wall - self.last_wall;
        let mono_elapsed = mono.saturating_duration_since(self.last_mono).as_millis() as i64;
        self.last_wall = wall;
        self.last_mono = mono;

        let jump = wall_elapsed - mono_elapsed;
        (jump > self.threshold_ms).then_some(jump)
    }
}

async fn resume_watch(ctx: Arc<NodeContext>) {
    let period = ctx.config.resume_check_interval;
    let threshold_ms = ctx.config.resume_jump_threshold.as_millis() as i64;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut detector = ResumeDetector::new(threshold_ms, now_millis(), std::time::Instant::now());
    loop {
        ticker.tick().await;
        if let Some(jump_ms) = detector.observe(now_millis(), std::time::Instant::now()) {
            info!(jump_ms, "Host resume detected");
            reconnect_all(&ctx);
        }
    }
}
