//! Dialing side: open a WebSocket to a peer address.

use std::sync::Arc;

use tracing::debug;

use crate::connection::ws_url;
use crate::context::{lock, NodeContext};
use crate::error::{NetError, Result};
use crate::handler::Side;
use crate::session;

/// Dial `addr` and run the session in the background.
///
/// Returns once the WebSocket is open. Only one dial per address is
/// in flight at a time, and the claim lasts until the dialed connection
/// closes; a second call meanwhile returns `Ok` without dialing.
pub async fn connect(ctx: &Arc<NodeContext>, addr: &str) -> Result<()> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(NetError::Validation("IP is required".into()));
    }
    if ctx.local_identity().is_none() {
        return Err(NetError::NotRegistered);
    }
    if !ctx.begin_dial(addr) {
        debug!(addr, "Dial already in progress");
        return Ok(());
    }

    let url = ws_url(addr, ctx.config.default_peer_port);
    debug!(url = %url, "Dialing peer");
    lock(&ctx.directory).mark_connecting(addr);

    match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => {
            let ctx = Arc::clone(ctx);
            let addr = addr.to_string();
            tokio::spawn(async move {
                session::run(Arc::clone(&ctx), ws, Side::Dialed, addr.clone()).await;
                release(&ctx, &addr);
            });
            Ok(())
        }
        Err(e) => {
            release(ctx, addr);
            Err(NetError::Connection(e))
        }
    }
}

/// Fire-and-forget [`connect`]; failures are logged and dropped; the
/// reconnect sweep will try again.
pub fn spawn_connect(ctx: &Arc<NodeContext>, addr: &str) {
    let ctx = Arc::clone(ctx);
    let addr = addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = connect(&ctx, &addr).await {
            debug!(addr = %addr, error = %e, "Background dial failed");
        }
    });
}

fn release(ctx: &NodeContext, addr: &str) {
    ctx.end_dial(addr);
    lock(&ctx.directory).clear_connecting(addr);
}
