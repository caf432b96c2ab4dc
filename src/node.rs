//! The node context: everything a running swarmd instance owns, built once
//! from configuration and shared by reference.

use crate::config::Config;
use crate::content::{BlockStore, Cid, ContentStore, MemoryBlockStore, SledBlockStore};
use crate::error::{AppError, ConfigError};
use crate::gossip::{Gossip, GossipError, MessageHandler, MessageId, SubscriptionHandle};
use crate::identity::{Identity, PeerId};
use crate::network::addr::PeerAddr;
use crate::network::connection_manager::ConnectionManager;
use crate::network::exchange::BlockExchange;
use crate::network::pnet::PreSharedKey;
use crate::network::server::NetworkServer;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IDENTITY_FILE: &str = "identity.key";
const BLOCKS_DIR: &str = "blocks";

pub struct Node {
    config: Config,
    identity: Arc<Identity>,
    connections: Arc<ConnectionManager>,
    gossip: Arc<Gossip>,
    content: Arc<ContentStore>,
    exchange: Arc<BlockExchange>,
    server: NetworkServer,
    sled: Option<Arc<SledBlockStore>>,
    cancel: CancellationToken,
}

impl Node {
    /// Assemble a node from already-loaded parts.
    pub fn new(
        config: Config,
        identity: Identity,
        psk: PreSharedKey,
        blocks: Arc<dyn BlockStore>,
        cancel: CancellationToken,
    ) -> Self {
        let identity = Arc::new(identity);
        let connections = Arc::new(ConnectionManager::new(
            identity.peer_id(),
            config.connection_limits(),
        ));
        let gossip = Arc::new(Gossip::new(identity.clone(), config.gossip_config()));
        let content = Arc::new(ContentStore::new(blocks, config.storage.chunk_size));
        let exchange = Arc::new(BlockExchange::new(
            content.clone(),
            gossip.clone(),
            config.fetch_timeout(),
        ));
        let server = NetworkServer::new(
            identity.clone(),
            Arc::new(psk),
            connections.clone(),
            gossip.clone(),
            exchange.clone(),
            config.handshake_timeout(),
            cancel.clone(),
        );
        Self {
            config,
            identity,
            connections,
            gossip,
            content,
            exchange,
            server,
            sled: None,
            cancel,
        }
    }

    /// Load identity, swarm key and block store as configured.
    pub fn from_config(config: Config, cancel: CancellationToken) -> Result<Self, AppError> {
        config.validate()?;
        let data_dir = config.data_dir();
        fs::create_dir_all(&data_dir).map_err(|source| ConfigError::Write {
            path: data_dir.display().to_string(),
            source,
        })?;

        let identity = load_identity(&config, &data_dir)?;
        let psk = config.psk()?;
        info!("🔐 Private network key fingerprint {}", psk.fingerprint());

        let mut sled = None;
        let blocks: Arc<dyn BlockStore> = match config.storage.backend.as_str() {
            "memory" => Arc::new(MemoryBlockStore::new()),
            _ => {
                let path = data_dir.join(BLOCKS_DIR);
                let store = Arc::new(SledBlockStore::open(&path.to_string_lossy())?);
                info!("💾 Block store at {}", path.display());
                sled = Some(store.clone());
                store
            }
        };

        let mut node = Self::new(config, identity, psk, blocks, cancel);
        node.sled = sled;
        Ok(node)
    }

    /// Bind the configured listen address and start the gossip heartbeat.
    pub async fn start(&self) -> Result<SocketAddr, AppError> {
        let addr = self.server.listen(&self.config.network.listen_address).await?;
        tokio::spawn(self.gossip.clone().run_heartbeat(self.cancel.clone()));
        info!("🚀 Node {} started", self.identity.peer_id());
        Ok(addr)
    }

    pub async fn dial(&self, addr: &str) -> Result<PeerId, AppError> {
        let addr: PeerAddr = addr.parse().map_err(AppError::InvalidAddress)?;
        self.server.dial(&addr).await
    }

    /// Keep dialling the configured bootstrap peers that are not connected
    /// until cancelled.
    pub fn spawn_bootstrap(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.maintain_bootstrap_peers().await })
    }

    async fn maintain_bootstrap_peers(&self) {
        let mut targets = Vec::new();
        for entry in &self.config.network.bootstrap_peers {
            match entry.parse::<PeerAddr>() {
                Ok(addr) => targets.push(addr),
                Err(e) => warn!("⚠️  Ignoring bootstrap peer {:?}: {}", entry, e),
            }
        }
        if targets.is_empty() {
            return;
        }

        // Peers learned by dialling addresses that did not name one
        let mut learned: HashMap<String, PeerId> = HashMap::new();
        let interval = Duration::from_secs(self.config.network.reconnect_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for addr in &targets {
                let target = addr.dial_target();
                let known = addr.peer_id.or_else(|| learned.get(&target).copied());
                if known.is_some_and(|peer| self.connections.is_connected(&peer)) {
                    continue;
                }
                match self.server.dial(addr).await {
                    Ok(peer) => {
                        learned.insert(target, peer);
                    }
                    Err(e) => debug!("Bootstrap dial to {} failed: {}", target, e),
                }
            }
        }
        debug!("🛑 Bootstrap loop stopped");
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn exchange(&self) -> &Arc<BlockExchange> {
        &self.exchange
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn list_peers(&self) -> HashSet<PeerId> {
        self.connections.list_peers()
    }

    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, GossipError> {
        self.gossip.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.gossip.unsubscribe(handle)
    }

    pub fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) -> Result<MessageId, GossipError> {
        self.gossip.publish(topic, data.into())
    }

    pub fn peers_of(&self, topic: &str) -> HashSet<PeerId> {
        self.gossip.peers_of(topic)
    }

    /// Make `cid` and its linked blocks local, asking `providers` first.
    pub async fn fetch(&self, cid: &Cid, providers: &[PeerId]) -> Result<(), AppError> {
        self.exchange.fetch_all(cid, providers).await?;
        Ok(())
    }

    /// Stop every task tied to this node and flush persistent storage.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(sled) = &self.sled {
            if let Err(e) = sled.flush() {
                warn!("⚠️  Failed to flush block store: {}", e);
            }
        }
    }
}

/// Configured key material wins; otherwise `<data_dir>/identity.key`, created
/// on first run.
fn load_identity(config: &Config, data_dir: &Path) -> Result<Identity, AppError> {
    if let Some(key) = config.node.private_key.as_deref() {
        return Ok(Identity::load_or_create(Some(key))?);
    }

    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let encoded = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let identity = Identity::from_protobuf_base64(encoded.trim())?;
        info!("🔑 Loaded identity {} from {}", identity.peer_id(), path.display());
        return Ok(identity);
    }

    let identity = Identity::generate();
    fs::write(&path, identity.to_protobuf_base64().as_bytes()).map_err(|source| {
        ConfigError::Write {
            path: path.display().to_string(),
            source,
        }
    })?;
    restrict_permissions(&path);
    info!("🔑 Generated identity {} at {}", identity.peer_id(), path.display());
    Ok(identity)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("⚠️  Could not restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
