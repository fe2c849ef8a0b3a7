//! Public handle to a running node.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use peerlink_shared::types::{Peer, Profile, UserId};
use peerlink_store::{Database, PendingOutboxMessage, ProfileInput, StoredChatMessage};

use crate::client;
use crate::config::NodeConfig;
use crate::context::{lock, NodeContext};
use crate::delivery::{self, GroupProgress};
use crate::error::{NetError, Result};
use crate::events::NodeEvent;
use crate::listener;
use crate::presence;

/// A running node: listener, presence timers and retry loop.
///
/// Dropping the handle stops the background tasks. Connections already
/// open end when their peers hang up or on [`Node::shutdown`].
pub struct Node {
    ctx: Arc<NodeContext>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the listener and start every background task.
    pub async fn start(config: NodeConfig, db: Database) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let ctx = NodeContext::new(config, db)?;

        let mut tasks = vec![tokio::spawn(listener::accept_loop(
            Arc::clone(&ctx),
            listener,
        ))];
        tasks.extend(presence::spawn_all(&ctx));
        tasks.push(tokio::spawn(delivery::retry_loop(Arc::clone(&ctx))));

        info!(addr = %local_addr, "Node listening");
        Ok(Self {
            ctx,
            local_addr,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive UI events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.events.subscribe()
    }

    // -- Profile --

    pub fn profile(&self) -> Option<Profile> {
        self.ctx.profile()
    }

    pub fn register(&self, input: &ProfileInput) -> Result<Profile> {
        lock(&self.ctx.db)
            .save_profile(input)
            .map_err(NetError::from_store)
    }

    pub fn clear_profile(&self) -> Result<bool> {
        Ok(lock(&self.ctx.db).clear_profile()?)
    }

    // -- Peers --

    pub async fn connect(&self, addr: &str) -> Result<()> {
        client::connect(&self.ctx, addr).await
    }

    /// Directory snapshot, sorted by name.
    pub fn peers(&self) -> Vec<Peer> {
        lock(&self.ctx.directory).snapshot()
    }

    /// Dial every known peer. Call when the host wakes from suspend.
    pub fn on_resume(&self) {
        info!("Resume signalled, reconnecting to all peers");
        presence::reconnect_all(&self.ctx);
    }

    // -- Messages --

    pub fn send_dm(&self, to: &UserId, text: &str) -> Result<String> {
        delivery::send_dm(&self.ctx, to, text)
    }

    pub fn send_public(&self, text: &str) -> Result<String> {
        delivery::send_public(&self.ctx, text)
    }

    pub fn pending_messages(&self) -> Vec<PendingOutboxMessage> {
        lock(&self.ctx.outbox).pending()
    }

    pub fn group_progress(&self, group_id: &str) -> Option<GroupProgress> {
        lock(&self.ctx.outbox).group(group_id)
    }

    pub fn chat_history(&self) -> Result<Vec<StoredChatMessage>> {
        Ok(lock(&self.ctx.db).load_chat_history()?)
    }

    pub fn clear_chat_history(&self) -> Result<()> {
        Ok(lock(&self.ctx.db).clear_chat_history()?)
    }

    /// Stop background tasks and close every bound connection.
    pub fn shutdown(self) {
        info!(addr = %self.local_addr, "Node shutting down");
        lock(&self.ctx.directory).close_all();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
