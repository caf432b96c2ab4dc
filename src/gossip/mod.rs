//! Topic-based publish/subscribe over managed connections.
//!
//! Each topic keeps the set of remote peers that announced it and a mesh
//! subset we eagerly forward to. Messages are signed by their origin and
//! deduplicated by `MessageId`. A periodic heartbeat keeps the mesh between
//! `mesh_n_low` and `mesh_n_high`, advertises recent ids to non-mesh peers
//! (`IHave`) and re-announces our topics. Outbound traffic goes through one
//! bounded `PeerQueue` per peer, so publishing never waits for the network.

pub mod dedup;
pub mod mesh;
pub mod queue;

use crate::identity::{Identity, PeerId};
use crate::network::message::WireMessage;
use crate::network::rate_limiter::RateLimiter;
use dashmap::DashMap;
use dedup::{MessageCache, SeenCache};
use mesh::TopicState;
use parking_lot::Mutex;
use queue::PeerQueue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub type MessageId = [u8; 32];

pub const MAX_TOPIC_LENGTH: usize = 256;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const SIGNATURE_DOMAIN: &[u8] = b"swarmd-gossip-v1:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    #[error("Outbound queue full for peer {0}, dropped oldest message")]
    PublishOverflow(String),
    #[error("Subscription limit exceeded: {0}")]
    SubscriptionLimitExceeded(String),
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("No peers subscribed to topic {0}")]
    NoPeers(String),
}

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH
}

/// A published message. Signed by `origin` over topic, seqno and data.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    pub origin: PeerId,
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl GossipMessage {
    pub fn new_signed(identity: &Identity, topic: &str, seqno: u64, data: Vec<u8>) -> Self {
        let origin = identity.peer_id();
        let signature = identity.sign(&Self::signed_payload(&origin, topic, seqno, &data));
        Self {
            origin,
            seqno,
            topic: topic.to_string(),
            data,
            signature,
        }
    }

    /// `blake3(origin || seqno_be)`
    pub fn id(&self) -> MessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.origin.as_bytes());
        hasher.update(&self.seqno.to_be_bytes());
        hasher.finalize().into()
    }

    pub fn verify(&self) -> bool {
        let payload = Self::signed_payload(&self.origin, &self.topic, self.seqno, &self.data);
        self.origin.verify(&payload, &self.signature)
    }

    // domain || origin(32) || topic_len(4) || topic || seqno(8) || data_len(4) || data
    fn signed_payload(origin: &PeerId, topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(SIGNATURE_DOMAIN.len() + 32 + 4 + topic.len() + 8 + 4 + data.len());
        payload.extend_from_slice(SIGNATURE_DOMAIN);
        payload.extend_from_slice(origin.as_bytes());
        payload.extend_from_slice(&(topic.len() as u32).to_le_bytes());
        payload.extend_from_slice(topic.as_bytes());
        payload.extend_from_slice(&seqno.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(data);
        payload
    }
}

impl fmt::Debug for GossipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GossipMessage")
            .field("origin", &self.origin)
            .field("seqno", &self.seqno)
            .field("topic", &self.topic)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Receives messages delivered on a subscribed topic.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &GossipMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&GossipMessage) + Send + Sync,
{
    fn handle(&self, message: &GossipMessage) {
        self(message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Deliver our own publishes to local handlers.
    pub emit_self: bool,
    pub allow_publish_to_zero_peers: bool,
    /// Publish to every known topic peer instead of only the mesh.
    pub flood_publish: bool,
    /// Topics a single remote peer may announce.
    pub max_inbound_streams: usize,
    /// Topics we may subscribe to locally.
    pub max_outbound_streams: usize,
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub max_ihave_length: usize,
    pub heartbeat_interval: Duration,
    pub announce_interval: Duration,
    pub seen_ttl: Duration,
    pub seen_capacity: usize,
    pub message_cache_size: usize,
    pub history_length: usize,
    pub gossip_windows: usize,
    pub outbound_queue_size: usize,
    pub max_message_size: usize,
    pub publish_rate_limit: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            emit_self: false,
            allow_publish_to_zero_peers: true,
            flood_publish: true,
            max_inbound_streams: 64,
            max_outbound_streams: 128,
            mesh_n: 6,
            mesh_n_low: 4,
            mesh_n_high: 12,
            gossip_lazy: 6,
            max_ihave_length: 100,
            heartbeat_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(10),
            seen_ttl: Duration::from_secs(120),
            seen_capacity: 10_000,
            message_cache_size: 1_000,
            history_length: 5,
            gossip_windows: 3,
            outbound_queue_size: 128,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            publish_rate_limit: 100,
        }
    }
}

pub struct Gossip {
    identity: Arc<Identity>,
    local_peer: PeerId,
    config: GossipConfig,
    topics: DashMap<String, TopicState>,
    peers: DashMap<PeerId, Arc<PeerQueue>>,
    seen: Mutex<SeenCache>,
    cache: Mutex<MessageCache>,
    rate_limiter: Mutex<RateLimiter>,
    seqno: AtomicU64,
    next_subscription: AtomicU64,
    ticks: AtomicU64,
}

impl Gossip {
    pub fn new(identity: Arc<Identity>, config: GossipConfig) -> Self {
        // Start from wall-clock nanos so a restarted node does not reuse ids.
        let seqno = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .unsigned_abs();
        Self {
            local_peer: identity.peer_id(),
            identity,
            seen: Mutex::new(SeenCache::new(config.seen_capacity, config.seen_ttl)),
            cache: Mutex::new(MessageCache::new(
                config.message_cache_size,
                config.history_length,
                config.gossip_windows,
            )),
            rate_limiter: Mutex::new(RateLimiter::new(config.publish_rate_limit)),
            config,
            topics: DashMap::new(),
            peers: DashMap::new(),
            seqno: AtomicU64::new(seqno),
            next_subscription: AtomicU64::new(1),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    // ---- peers ----

    /// Register a connected peer and return the queue its writer task drains.
    /// Our current topics are announced to it right away.
    pub fn add_peer(&self, peer: PeerId) -> Arc<PeerQueue> {
        let queue = Arc::new(PeerQueue::new(peer, self.config.outbound_queue_size));
        if let Some(previous) = self.peers.insert(peer, queue.clone()) {
            previous.close();
        }
        let topics = self.topics();
        if !topics.is_empty() {
            self.send(&peer, WireMessage::Subscribe { topics });
        }
        debug!("🔗 Gossip peer added: {}", peer.short());
        queue
    }

    /// Forget a disconnected peer: its queue, topic announcements and mesh slots.
    pub fn remove_peer(&self, peer: &PeerId) {
        if let Some((_, queue)) = self.peers.remove(peer) {
            queue.close();
        }
        for mut state in self.topics.iter_mut() {
            state.remove_peer(peer);
        }
        self.topics.retain(|_, state| !state.is_idle());
        self.rate_limiter.lock().forget(peer);
        debug!("🔌 Gossip peer removed: {}", peer.short());
    }

    pub fn connected_peers(&self) -> HashSet<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Queue a message for one connected peer outside the gossip protocol.
    /// Returns false if the peer is not connected.
    pub fn send_direct(&self, peer: &PeerId, message: WireMessage) -> bool {
        if !self.peers.contains_key(peer) {
            return false;
        }
        self.send(peer, message);
        true
    }

    fn send(&self, peer: &PeerId, message: WireMessage) {
        let Some(queue) = self.peers.get(peer).map(|entry| entry.value().clone()) else {
            return;
        };
        if let Err(e) = queue.push(message) {
            warn!("⚠️  {}", e);
        }
    }

    fn broadcast(&self, message: WireMessage) {
        let queues: Vec<Arc<PeerQueue>> =
            self.peers.iter().map(|entry| entry.value().clone()).collect();
        for queue in queues {
            if let Err(e) = queue.push(message.clone()) {
                warn!("⚠️  {}", e);
            }
        }
    }

    // ---- local API ----

    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, GossipError> {
        if !is_valid_topic(topic) {
            return Err(GossipError::InvalidTopic(topic.to_string()));
        }
        let local_count = self
            .topics
            .iter()
            .filter(|entry| entry.key() != topic && entry.is_subscribed())
            .count();

        let (handle, grafts) = {
            let mut state = self.topics.entry(topic.to_string()).or_default();
            if let Some(id) = state.find_handler(&handler) {
                return Ok(SubscriptionHandle {
                    topic: topic.to_string(),
                    id,
                });
            }
            let first = !state.is_subscribed();
            if first && local_count >= self.config.max_outbound_streams {
                let idle = state.is_idle();
                drop(state);
                if idle {
                    self.topics.remove_if(topic, |_, state| state.is_idle());
                }
                return Err(GossipError::SubscriptionLimitExceeded(format!(
                    "already subscribed to {} topics",
                    local_count
                )));
            }

            let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
            state.handlers.push((id, handler));
            let grafts = if first {
                Some(state.fill_mesh(self.config.mesh_n))
            } else {
                None
            };
            (
                SubscriptionHandle {
                    topic: topic.to_string(),
                    id,
                },
                grafts,
            )
        };

        if let Some(grafts) = grafts {
            info!("📡 Subscribed to topic {}", topic);
            self.broadcast(WireMessage::Subscribe {
                topics: vec![topic.to_string()],
            });
            for peer in grafts {
                self.send(
                    &peer,
                    WireMessage::Graft {
                        topic: topic.to_string(),
                    },
                );
            }
        }
        Ok(handle)
    }

    /// Remove one handler. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let (removed, pruned) = match self.topics.get_mut(&handle.topic) {
            None => return false,
            Some(mut state) => {
                let removed = state.remove_handler(handle.id);
                if removed && !state.is_subscribed() {
                    (true, Some(state.mesh.drain().collect::<Vec<_>>()))
                } else {
                    (removed, None)
                }
            }
        };

        if let Some(pruned) = pruned {
            self.topics
                .remove_if(&handle.topic, |_, state| state.is_idle());
            info!("📴 Unsubscribed from topic {}", handle.topic);
            self.broadcast(WireMessage::Unsubscribe {
                topics: vec![handle.topic.clone()],
            });
            for peer in pruned {
                self.send(
                    &peer,
                    WireMessage::Prune {
                        topic: handle.topic.clone(),
                    },
                );
            }
        }
        removed
    }

    pub fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId, GossipError> {
        if !is_valid_topic(topic) {
            return Err(GossipError::InvalidTopic(topic.to_string()));
        }
        if data.len() > self.config.max_message_size {
            return Err(GossipError::MessageTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }

        let (targets, handlers) = match self.topics.get(topic) {
            Some(state) => {
                let targets: Vec<PeerId> = if self.config.flood_publish {
                    state.subscribers.iter().copied().collect()
                } else if !state.mesh.is_empty() {
                    state.mesh.iter().copied().collect()
                } else {
                    state.gossip_targets(self.config.mesh_n)
                };
                (targets, state.handlers())
            }
            None => (Vec::new(), Vec::new()),
        };

        if targets.is_empty() && !self.config.allow_publish_to_zero_peers {
            return Err(GossipError::NoPeers(topic.to_string()));
        }

        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed);
        let message = GossipMessage::new_signed(&self.identity, topic, seqno, data);
        let id = message.id();
        self.seen.lock().check_and_insert(&id);
        self.cache.lock().put(message.clone());

        if self.config.emit_self {
            for handler in &handlers {
                handler.handle(&message);
            }
        }

        debug!(
            "📤 Publishing {} bytes on {} to {} peer(s)",
            message.data.len(),
            topic,
            targets.len()
        );
        for peer in targets {
            self.send(&peer, WireMessage::Publish(message.clone()));
        }
        Ok(id)
    }

    /// Remote peers that announced `topic`.
    pub fn peers_of(&self, topic: &str) -> HashSet<PeerId> {
        self.topics
            .get(topic)
            .map(|state| state.subscribers.clone())
            .unwrap_or_default()
    }

    pub fn mesh_peers(&self, topic: &str) -> HashSet<PeerId> {
        self.topics
            .get(topic)
            .map(|state| state.mesh.clone())
            .unwrap_or_default()
    }

    /// Topics with at least one local handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.is_subscribed())
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    // ---- inbound ----

    pub fn handle_message(&self, from: PeerId, message: WireMessage) {
        if !self.rate_limiter.lock().check(message.kind(), from) {
            debug!(
                "🚦 Rate limited {} message from {}",
                message.kind(),
                from.short()
            );
            return;
        }

        match message {
            WireMessage::Subscribe { topics } => {
                for topic in topics {
                    self.add_remote_subscription(from, topic);
                }
            }
            WireMessage::Unsubscribe { topics } => {
                for topic in topics {
                    self.remove_remote_subscription(&from, &topic);
                }
            }
            WireMessage::Heartbeat { topics } => {
                let announced: HashSet<String> = topics.into_iter().collect();
                let current = self.topics_of_peer(&from);
                for topic in current.difference(&announced) {
                    self.remove_remote_subscription(&from, topic);
                }
                for topic in announced.difference(&current) {
                    self.add_remote_subscription(from, topic.clone());
                }
            }
            WireMessage::Publish(message) => self.handle_publish(from, message),
            WireMessage::Graft { topic } => self.handle_graft(from, topic),
            WireMessage::Prune { topic } => {
                if let Some(mut state) = self.topics.get_mut(&topic) {
                    state.mesh.remove(&from);
                }
            }
            WireMessage::IHave { topic, message_ids } => {
                self.handle_ihave(from, &topic, message_ids)
            }
            WireMessage::IWant { message_ids } => self.handle_iwant(from, message_ids),
            WireMessage::WantBlock { .. } | WireMessage::Block { .. } => {
                trace!("Ignoring block exchange message from {}", from.short());
            }
        }
    }

    fn topics_of_peer(&self, peer: &PeerId) -> HashSet<String> {
        self.topics
            .iter()
            .filter(|entry| entry.subscribers.contains(peer))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn add_remote_subscription(&self, from: PeerId, topic: String) {
        if !is_valid_topic(&topic) {
            debug!("Ignoring invalid topic announcement from {}", from.short());
            return;
        }
        if self
            .topics
            .get(&topic)
            .is_some_and(|state| state.subscribers.contains(&from))
        {
            return;
        }
        let announced = self
            .topics
            .iter()
            .filter(|entry| entry.subscribers.contains(&from))
            .count();
        if announced >= self.config.max_inbound_streams {
            warn!(
                "⚠️  {} (peer {}, topic {})",
                GossipError::SubscriptionLimitExceeded(format!(
                    "peer announced {} topics",
                    announced
                )),
                from.short(),
                topic
            );
            return;
        }

        let graft = {
            let mut state = self.topics.entry(topic.clone()).or_default();
            state.subscribers.insert(from);
            state.is_subscribed()
                && state.mesh.len() < self.config.mesh_n
                && state.mesh.insert(from)
        };
        trace!("Peer {} subscribed to {}", from.short(), topic);
        if graft {
            self.send(&from, WireMessage::Graft { topic });
        }
    }

    fn remove_remote_subscription(&self, from: &PeerId, topic: &str) {
        if let Some(mut state) = self.topics.get_mut(topic) {
            state.remove_peer(from);
        }
        self.topics.remove_if(topic, |_, state| state.is_idle());
    }

    fn handle_publish(&self, from: PeerId, message: GossipMessage) {
        if !is_valid_topic(&message.topic) || message.data.len() > self.config.max_message_size {
            debug!("Dropping malformed message from {}", from.short());
            return;
        }
        if message.origin == self.local_peer {
            return;
        }
        if !message.verify() {
            warn!(
                "⚠️  Dropping message with invalid signature from {} (origin {})",
                from.short(),
                message.origin.short()
            );
            return;
        }

        let id = message.id();
        if self.seen.lock().check_and_insert(&id) {
            trace!("Duplicate message {} from {}", hex::encode(&id[..6]), from.short());
            return;
        }
        self.cache.lock().put(message.clone());

        let (handlers, forward) = match self.topics.get(&message.topic) {
            Some(state) if state.is_subscribed() => {
                let pool = if state.mesh.is_empty() {
                    &state.subscribers
                } else {
                    &state.mesh
                };
                let forward: Vec<PeerId> = pool
                    .iter()
                    .filter(|peer| **peer != from && **peer != message.origin)
                    .copied()
                    .collect();
                (state.handlers(), forward)
            }
            _ => return,
        };

        debug!(
            "📨 Message on {} from {} ({} bytes)",
            message.topic,
            message.origin.short(),
            message.data.len()
        );
        for handler in &handlers {
            handler.handle(&message);
        }
        for peer in forward {
            self.send(&peer, WireMessage::Publish(message.clone()));
        }
    }

    fn handle_graft(&self, from: PeerId, topic: String) {
        let accepted = match self.topics.get_mut(&topic) {
            Some(mut state) if state.is_subscribed() && state.subscribers.contains(&from) => {
                state.mesh.insert(from);
                true
            }
            _ => false,
        };
        if !accepted {
            self.send(&from, WireMessage::Prune { topic });
        }
    }

    fn handle_ihave(&self, from: PeerId, topic: &str, message_ids: Vec<MessageId>) {
        if !self
            .topics
            .get(topic)
            .is_some_and(|state| state.is_subscribed())
        {
            return;
        }
        let wanted: Vec<MessageId> = {
            let seen = self.seen.lock();
            message_ids
                .into_iter()
                .filter(|id| !seen.contains(id))
                .take(self.config.max_ihave_length)
                .collect()
        };
        if !wanted.is_empty() {
            self.send(
                &from,
                WireMessage::IWant {
                    message_ids: wanted,
                },
            );
        }
    }

    fn handle_iwant(&self, from: PeerId, message_ids: Vec<MessageId>) {
        let messages: Vec<GossipMessage> = {
            let cache = self.cache.lock();
            message_ids
                .iter()
                .take(self.config.max_ihave_length)
                .filter_map(|id| cache.get(id).cloned())
                .collect()
        };
        for message in messages {
            self.send(&from, WireMessage::Publish(message));
        }
    }

    // ---- maintenance ----

    /// One round of mesh maintenance and lazy gossip.
    pub fn heartbeat(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut control = Vec::new();
        let mut lazy = Vec::new();

        for mut entry in self.topics.iter_mut() {
            let topic = entry.key().clone();
            let state = entry.value_mut();
            if !state.is_subscribed() {
                continue;
            }
            let TopicState {
                subscribers, mesh, ..
            } = &mut *state;
            mesh.retain(|peer| subscribers.contains(peer));

            if state.mesh.len() < self.config.mesh_n_low {
                for peer in state.fill_mesh(self.config.mesh_n) {
                    control.push((peer, WireMessage::Graft { topic: topic.clone() }));
                }
            }
            if state.mesh.len() > self.config.mesh_n_high {
                for peer in state.trim_mesh(self.config.mesh_n) {
                    control.push((peer, WireMessage::Prune { topic: topic.clone() }));
                }
            }
            let targets = state.gossip_targets(self.config.gossip_lazy);
            if !targets.is_empty() {
                lazy.push((topic, targets));
            }
        }

        for (topic, targets) in lazy {
            let message_ids = self
                .cache
                .lock()
                .recent_ids(&topic, self.config.max_ihave_length);
            if message_ids.is_empty() {
                continue;
            }
            for peer in targets {
                self.send(
                    &peer,
                    WireMessage::IHave {
                        topic: topic.clone(),
                        message_ids: message_ids.clone(),
                    },
                );
            }
        }
        for (peer, message) in control {
            self.send(&peer, message);
        }

        self.cache.lock().shift();
        self.seen.lock().expire();

        let heartbeat_ms = self.config.heartbeat_interval.as_millis().max(1);
        let announce_every = (self.config.announce_interval.as_millis() / heartbeat_ms).max(1);
        if u128::from(tick) % announce_every == 0 {
            self.broadcast(WireMessage::Heartbeat {
                topics: self.topics(),
            });
        }
    }

    /// Run the heartbeat until cancelled.
    pub async fn run_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("🛑 Gossip heartbeat stopped");
                    break;
                }
                _ = interval.tick() => self.heartbeat(),
            }
        }
    }
}
