//! Accepting side: one session per inbound WebSocket.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::handler::Side;
use crate::session;

pub async fn accept_loop(ctx: Arc<NodeContext>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!(remote = %remote, "Incoming connection");

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    info!(remote = %remote, "WebSocket accepted");
                    session::run(ctx, ws, Side::Accepted, remote.to_string()).await;
                }
                Err(e) => debug!(remote = %remote, error = %e, "WebSocket handshake failed"),
            }
        });
    }
}
