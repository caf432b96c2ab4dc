//! Block exchange between directly connected peers.
//!
//! A node that learns a CID it does not hold asks its peers for the block
//! (`WantBlock`) and waits for the first `Block` reply that hashes to it.
//! Replies nobody asked for are dropped.

use crate::content::{Cid, ContentError, ContentStore};
use crate::gossip::Gossip;
use crate::identity::PeerId;
use crate::network::message::WireMessage;
use crate::network::rate_limiter::RateLimiter;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

type BlockSender = oneshot::Sender<Bytes>;

pub struct BlockExchange {
    content: Arc<ContentStore>,
    gossip: Arc<Gossip>,
    /// Waiters per requested block
    pending: DashMap<Cid, Vec<BlockSender>>,
    rate_limiter: Mutex<RateLimiter>,
    timeout: Duration,
}

impl BlockExchange {
    pub fn new(content: Arc<ContentStore>, gossip: Arc<Gossip>, timeout: Duration) -> Self {
        Self {
            content,
            gossip,
            pending: DashMap::new(),
            rate_limiter: Mutex::new(RateLimiter::new(0)),
            timeout,
        }
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Return a block, asking the connected `providers` if it is not held
    /// locally. Falls back to every connected peer when none of them is.
    pub async fn fetch(&self, cid: &Cid, providers: &[PeerId]) -> Result<Bytes, ContentError> {
        match self.content.get(cid).await {
            Ok(data) => return Ok(data),
            Err(ContentError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let connected = self.gossip.connected_peers();
        let mut targets: Vec<PeerId> = providers
            .iter()
            .filter(|p| connected.contains(p))
            .copied()
            .collect();
        if targets.is_empty() {
            targets = connected.into_iter().collect();
        }
        if targets.is_empty() {
            return Err(ContentError::NotFound(format!(
                "{} (not held locally, no peers to ask)",
                cid
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.entry(*cid).or_default().push(tx);
        for peer in &targets {
            self.gossip
                .send_direct(peer, WireMessage::WantBlock { cid: *cid });
        }
        debug!("🔎 Requested block {} from {} peer(s)", cid, targets.len());

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            _ => {
                self.drop_closed_waiters(cid);
                Err(ContentError::NotFound(format!(
                    "{} (no peer supplied it within {:?})",
                    cid, self.timeout
                )))
            }
        }
    }

    /// Make a block and everything it links to available locally.
    pub async fn fetch_all(&self, root: &Cid, providers: &[PeerId]) -> Result<(), ContentError> {
        self.fetch(root, providers).await?;
        for link in self.content.links(root).await? {
            self.fetch(&link, providers).await?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Called from the connection reader for `WantBlock` and `Block` frames.
    pub fn handle_message(self: &Arc<Self>, from: PeerId, message: WireMessage) {
        if !self.rate_limiter.lock().check("exchange", from) {
            debug!("Rate limited block exchange from {}", from.short());
            return;
        }
        match message {
            WireMessage::WantBlock { cid } => {
                let exchange = self.clone();
                tokio::spawn(async move { exchange.serve_block(from, cid).await });
            }
            WireMessage::Block { cid, data } => {
                if !self.pending.contains_key(&cid) {
                    trace!("Unsolicited block {} from {}", cid, from.short());
                    return;
                }
                let exchange = self.clone();
                tokio::spawn(async move { exchange.accept_block(from, cid, data).await });
            }
            other => trace!("Ignoring {} message in block exchange", other.kind()),
        }
    }

    pub fn forget_peer(&self, peer: &PeerId) {
        self.rate_limiter.lock().forget(peer);
    }

    async fn serve_block(&self, to: PeerId, cid: Cid) {
        match self.content.get(&cid).await {
            Ok(data) => {
                trace!("Serving block {} to {}", cid, to.short());
                self.gossip.send_direct(
                    &to,
                    WireMessage::Block {
                        cid,
                        data: data.to_vec(),
                    },
                );
            }
            Err(ContentError::NotFound(_)) => {}
            Err(e) => warn!("⚠️  Cannot serve block {} to {}: {}", cid, to.short(), e),
        }
    }

    async fn accept_block(&self, from: PeerId, cid: Cid, data: Vec<u8>) {
        let data = Bytes::from(data);
        if let Err(e) = self.content.import_block(&cid, data.clone()).await {
            warn!("⚠️  Rejected block {} from {}: {}", cid, from.short(), e);
            return;
        }
        if let Some((_, waiters)) = self.pending.remove(&cid) {
            debug!("📥 Received block {} from {}", cid, from.short());
            for waiter in waiters {
                let _ = waiter.send(data.clone());
            }
        }
    }

    fn drop_closed_waiters(&self, cid: &Cid) {
        if let Some(mut waiters) = self.pending.get_mut(cid) {
            waiters.retain(|w| !w.is_closed());
        }
        self.pending.remove_if(cid, |_, waiters| waiters.is_empty());
    }
}
