//! Listener and dialer. Every raw stream goes through the private network
//! guard, then the secure channel, then the connection manager, before a
//! connection task is spawned for it.

use crate::error::AppError;
use crate::gossip::Gossip;
use crate::identity::{Identity, PeerId};
use crate::network::addr::PeerAddr;
use crate::network::connection_manager::{ConnectionDirection, ConnectionManager};
use crate::network::exchange::BlockExchange;
use crate::network::pnet::{self, PnetError, PreSharedKey};
use crate::network::{peer, secure_channel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct NetworkServer {
    identity: Arc<Identity>,
    psk: Arc<PreSharedKey>,
    connections: Arc<ConnectionManager>,
    gossip: Arc<Gossip>,
    exchange: Arc<BlockExchange>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
}

impl NetworkServer {
    pub fn new(
        identity: Arc<Identity>,
        psk: Arc<PreSharedKey>,
        connections: Arc<ConnectionManager>,
        gossip: Arc<Gossip>,
        exchange: Arc<BlockExchange>,
        handshake_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            psk,
            connections,
            gossip,
            exchange,
            handshake_timeout,
            cancel,
        }
    }

    /// Bind and spawn the accept loop. Returns the bound address.
    pub async fn listen(&self, bind_addr: &str) -> Result<SocketAddr, AppError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("👂 Listening on {}", local_addr);

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(local_addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("🛑 Accept loop stopped");
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("🔌 Inbound connection from {}", addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        let remote = addr.to_string();
                        if let Err(e) = server
                            .establish(stream, remote.clone(), ConnectionDirection::Inbound, None)
                            .await
                        {
                            warn!("🚫 Rejected inbound connection from {}: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Dial a peer. Returns its verified PeerId once the connection is open.
    pub async fn dial(&self, addr: &PeerAddr) -> Result<PeerId, AppError> {
        if let Some(peer) = addr.peer_id {
            if self.connections.is_connected(&peer) {
                return Ok(peer);
            }
        }
        let target = addr.dial_target();
        let stream = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| PnetError::HandshakeFailed(format!("connect to {} timed out", target)))??;
        stream.set_nodelay(true)?;
        self.establish(stream, target, ConnectionDirection::Outbound, addr.peer_id)
            .await
    }

    /// Run both handshakes over any ordered byte stream and register the result.
    pub async fn establish<S>(
        &self,
        stream: S,
        remote_addr: String,
        direction: ConnectionDirection,
        expected: Option<PeerId>,
    ) -> Result<PeerId, AppError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let attempt = self.connections.begin_connecting(&remote_addr, direction)?;

        let handshake = async {
            let guarded = pnet::protect(stream, &self.psk).await?;
            let secure = secure_channel::handshake(guarded, &self.identity, expected).await?;
            Ok::<_, AppError>(secure)
        };
        let secure = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(secure)) => secure,
            Ok(Err(e)) => {
                self.connections.connection_failed(attempt);
                return Err(e);
            }
            Err(_) => {
                self.connections.connection_failed(attempt);
                return Err(PnetError::HandshakeFailed(format!(
                    "handshake with {} timed out after {:?}",
                    remote_addr, self.handshake_timeout
                ))
                .into());
            }
        };

        let remote_peer = secure.remote_peer();
        let info = self
            .connections
            .on_connection_established(attempt, remote_peer)?;
        info!(
            "🤝 Connected to {} ({:?}, {})",
            remote_peer.short(),
            direction,
            remote_addr
        );

        tokio::spawn(peer::run_connection(
            secure,
            info,
            self.gossip.clone(),
            self.exchange.clone(),
            self.connections.clone(),
            self.cancel.clone(),
        ));
        Ok(remote_peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentStore;
    use crate::gossip::GossipConfig;
    use crate::network::connection_manager::{ConnectionLimits, PeerEvent};

    fn server_with_timeout(psk: &PreSharedKey, handshake_timeout: Duration) -> NetworkServer {
        let identity = Arc::new(Identity::generate());
        let connections = Arc::new(ConnectionManager::new(
            identity.peer_id(),
            ConnectionLimits::default(),
        ));
        let gossip = Arc::new(Gossip::new(identity.clone(), GossipConfig::default()));
        let exchange = Arc::new(BlockExchange::new(
            Arc::new(ContentStore::in_memory()),
            gossip.clone(),
            Duration::from_secs(1),
        ));
        NetworkServer::new(
            identity,
            Arc::new(psk.clone()),
            connections,
            gossip,
            exchange,
            handshake_timeout,
            CancellationToken::new(),
        )
    }

    fn server(psk: &PreSharedKey) -> NetworkServer {
        server_with_timeout(psk, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_establish_over_duplex() {
        let psk = PreSharedKey::generate();
        let a = server(&psk);
        let b = server(&psk);
        let (_listener, mut events) = a.connections.subscribe_events();
        let (left, right) = tokio::io::duplex(64 * 1024);

        let b_peer = b.identity.peer_id();
        let a_peer = a.identity.peer_id();
        let (ra, rb) = tokio::join!(
            a.establish(left, "duplex".into(), ConnectionDirection::Outbound, Some(b_peer)),
            b.establish(right, "duplex".into(), ConnectionDirection::Inbound, None),
        );
        assert_eq!(ra.unwrap(), b_peer);
        assert_eq!(rb.unwrap(), a_peer);
        assert!(a.connections.is_connected(&b_peer));
        assert!(matches!(
            events.recv().await,
            Some(PeerEvent::Connected { peer, .. }) if peer == b_peer
        ));

        // Closing one side removes the peer on the other.
        b.cancel.cancel();
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(5), events.recv()).await,
            Ok(Some(PeerEvent::Disconnected { peer })) if peer == b_peer
        ));
        assert!(!a.connections.is_connected(&b_peer));
        assert!(a.gossip.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_psk_never_registers() {
        let a = server(&PreSharedKey::generate());
        let c = server(&PreSharedKey::generate());
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (ra, rc) = tokio::join!(
            a.establish(left, "duplex".into(), ConnectionDirection::Inbound, None),
            c.establish(right, "duplex".into(), ConnectionDirection::Outbound, None),
        );
        assert!(ra.is_err());
        assert!(rc.is_err());
        assert!(a.connections.list_peers().is_empty());
        assert_eq!(a.connections.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let a = server_with_timeout(&PreSharedKey::generate(), Duration::from_millis(100));
        let (left, _right) = tokio::io::duplex(1024);
        let result = a
            .establish(left, "silent".into(), ConnectionDirection::Inbound, None)
            .await;
        assert!(matches!(
            result,
            Err(AppError::Pnet(PnetError::HandshakeFailed(_)))
        ));
        assert_eq!(a.connections.pending_count(), 0);
    }
}
