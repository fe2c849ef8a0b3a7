//! Per-connection task: one reader loop plus one writer task.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use peerlink_shared::protocol::{Frame, HelloPayload, WsEnvelope};

use crate::connection::{Outgoing, PeerConnection};
use crate::context::NodeContext;
use crate::handler::{self, Side};

/// Drive a WebSocket until it closes.
///
/// Outbound frames are queued on the connection handle and written by a
/// separate task, so frame handlers never wait on the network. A dialed
/// session opens with HELLO.
pub async fn run<S>(ctx: Arc<NodeContext>, ws: WebSocketStream<S>, side: Side, addr: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (conn, mut outgoing) = PeerConnection::new(addr);

    let writer_addr = conn.addr().to_string();
    let writer = tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Outgoing::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(addr = %writer_addr, error = %e, "Write failed");
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    if side == Side::Dialed {
        match ctx.local_identity() {
            Some(me) => {
                let hello = WsEnvelope::new(me, Frame::Hello(HelloPayload::default()));
                if let Err(e) = conn.send(&hello) {
                    warn!(addr = conn.addr(), error = %e, "Failed to queue HELLO");
                }
            }
            None => conn.close(),
        }
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handler::handle_text(&ctx, &conn, side, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(addr = conn.addr(), error = %e, "Read failed");
                break;
            }
        }
    }

    writer.abort();
    handler::on_close(&ctx, &conn);
    debug!(addr = conn.addr(), ?side, "Session ended");
}
