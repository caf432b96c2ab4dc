//! Per-connection I/O: one reader task feeding the gossip engine and the
//! block exchange, one writer task draining the peer's outbound queue.

use crate::gossip::queue::PeerQueue;
use crate::gossip::Gossip;
use crate::network::connection_manager::{ConnectionInfo, ConnectionManager};
use crate::network::exchange::BlockExchange;
use crate::network::message::WireMessage;
use crate::network::secure_channel::{SecureConnection, SecureWriter};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drive an established connection until either side closes it or the node
/// shuts down, then tear down its gossip state and roster entry.
pub async fn run_connection<S>(
    connection: SecureConnection<S>,
    info: ConnectionInfo,
    gossip: Arc<Gossip>,
    exchange: Arc<BlockExchange>,
    connections: Arc<ConnectionManager>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let peer = info.remote_peer;
    let (mut reader, writer) = connection.into_split();
    let queue = gossip.add_peer(peer);

    let conn_cancel = cancel.child_token();
    let writer_task = tokio::spawn(write_loop(writer, queue.clone(), conn_cancel.clone()));

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            result = reader.recv() => match result {
                Ok(Some(message @ (WireMessage::WantBlock { .. } | WireMessage::Block { .. }))) => {
                    exchange.handle_message(peer, message)
                }
                Ok(Some(message)) => gossip.handle_message(peer, message),
                Ok(None) => {
                    debug!("🔌 Peer {} closed the connection", peer.short());
                    break;
                }
                Err(e) => {
                    warn!("⚠️  Connection to {} failed: {}", peer.short(), e);
                    break;
                }
            },
        }
    }

    conn_cancel.cancel();
    queue.close();
    let _ = writer_task.await;

    // Gossip state first so a reconnect cannot register before we clear it.
    gossip.remove_peer(&peer);
    exchange.forget_peer(&peer);
    if let Some(closed) = connections.on_connection_closed(&peer, info.id) {
        info!(
            "👋 Disconnected from {} ({}) after {:?}",
            peer.short(),
            closed.remote_addr,
            closed.opened_at.elapsed()
        );
    }
}

async fn write_loop<S>(
    mut writer: SecureWriter<WriteHalf<S>>,
    queue: Arc<PeerQueue>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite,
{
    let peer = queue.peer();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.pop() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = writer.send(&message).await {
            debug!("Write to {} failed: {}", peer.short(), e);
            cancel.cancel();
            break;
        }
    }
    let _ = writer.close().await;
}
