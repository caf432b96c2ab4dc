//! Demo workload: every interval, add a small file and a structured value
//! to the content store and announce their CIDs on two topics. Incoming
//! announcements are resolved (fetching blocks from peers when needed) and
//! logged.

use crate::config::OrchestratorConfig;
use crate::content::{Cid, ContentError};
use crate::error::AppError;
use crate::gossip::{GossipMessage, MessageHandler, SubscriptionHandle};
use crate::identity::PeerId;
use crate::network::connection_manager::PeerEvent;
use crate::node::Node;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announcement {
    File,
    Dag,
}

/// Content resolved from an announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    File { from: PeerId, cid: Cid, content: String },
    Dag { from: PeerId, cid: Cid, value: Value },
}

/// CIDs announced by one producer round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Produced {
    pub round: u64,
    pub file: Cid,
    pub dag: Cid,
}

pub struct Orchestrator {
    node: Arc<Node>,
    file_topic: String,
    dag_topic: String,
    interval: Duration,
    round: AtomicU64,
    observer: Option<mpsc::UnboundedSender<Retrieved>>,
}

impl Orchestrator {
    pub fn new(node: Arc<Node>, config: &OrchestratorConfig) -> Self {
        Self {
            node,
            file_topic: config.file_topic.clone(),
            dag_topic: config.dag_topic.clone(),
            interval: Duration::from_secs(config.interval_secs),
            round: AtomicU64::new(0),
            observer: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Also report every resolved announcement on `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<Retrieved>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start the peer logger, the topic handlers and the producer loop.
    /// All of them stop with the node's cancellation token.
    pub fn spawn(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>, AppError> {
        let mut tasks = vec![self.spawn_peer_logger()];
        tasks.push(self.spawn_handlers()?);
        let producer = self.clone();
        tasks.push(tokio::spawn(async move { producer.run().await }));
        Ok(tasks)
    }

    /// Log every connect and disconnect.
    pub fn spawn_peer_logger(&self) -> JoinHandle<()> {
        let connections = self.node.connections().clone();
        let cancel = self.node.cancel_token();
        let (listener, mut events) = connections.subscribe_events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    PeerEvent::Connected { peer, addr, .. } => {
                        info!("🟢 peer:connect {} ({})", peer, addr)
                    }
                    PeerEvent::Disconnected { peer } => info!("🔴 peer:disconnect {}", peer),
                }
            }
            connections.unsubscribe_events(listener);
        })
    }

    /// Subscribe to both topics. Handlers only enqueue; resolution runs on
    /// its own task per message.
    pub fn spawn_handlers(self: &Arc<Self>) -> Result<JoinHandle<()>, AppError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Announcement, GossipMessage)>();
        let handles = [
            (self.file_topic.as_str(), Announcement::File),
            (self.dag_topic.as_str(), Announcement::Dag),
        ]
        .into_iter()
        .map(|(topic, kind)| {
            let tx = tx.clone();
            let handler: Arc<dyn MessageHandler> = Arc::new(move |message: &GossipMessage| {
                let _ = tx.send((kind, message.clone()));
            });
            self.node.subscribe(topic, handler)
        })
        .collect::<Result<Vec<SubscriptionHandle>, _>>()?;
        drop(tx);

        let orchestrator = self.clone();
        let cancel = self.node.cancel_token();
        Ok(tokio::spawn(async move {
            loop {
                let (kind, message) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(received) => received,
                        None => break,
                    },
                };
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.resolve(kind, message).await });
            }
            for handle in &handles {
                orchestrator.node.unsubscribe(handle);
            }
        }))
    }

    async fn resolve(&self, kind: Announcement, message: GossipMessage) {
        let from = message.origin;
        let text = String::from_utf8_lossy(&message.data).into_owned();
        let label = match kind {
            Announcement::File => "file",
            Announcement::Dag => "dag",
        };
        info!("📨 got {} message: {} {}", label, from, text);

        let cid: Cid = match text.parse() {
            Ok(cid) => cid,
            Err(e) => {
                warn!("⚠️  Ignoring {} message from {}: {}", label, from.short(), e);
                return;
            }
        };

        let retrieved = match self.retrieve(kind, from, cid).await {
            Ok(retrieved) => retrieved,
            Err(AppError::Content(ContentError::NotFound(what))) => {
                warn!("⚠️  Content {} announced by {} is unavailable", what, from.short());
                return;
            }
            Err(e) => {
                warn!("⚠️  Failed to read {} {}: {}", label, cid, e);
                return;
            }
        };
        match &retrieved {
            Retrieved::File { content, .. } => info!("📄 got file: {}", content),
            Retrieved::Dag { value, .. } => info!("🧩 got dag: {}", value),
        }
        if let Some(observer) = &self.observer {
            let _ = observer.send(retrieved);
        }
    }

    async fn retrieve(
        &self,
        kind: Announcement,
        from: PeerId,
        cid: Cid,
    ) -> Result<Retrieved, AppError> {
        self.node.fetch(&cid, &[from]).await?;
        let content = self.node.content();
        Ok(match kind {
            Announcement::File => {
                let chunks: Vec<_> = content.cat(&cid).try_collect().await?;
                Retrieved::File {
                    from,
                    cid,
                    content: String::from_utf8_lossy(&chunks.concat()).into_owned(),
                }
            }
            Announcement::Dag => Retrieved::Dag {
                from,
                cid,
                value: content.get_value(&cid).await?,
            },
        })
    }

    /// One producer round: log the file topic's peers, then add and announce
    /// one file and one structured value.
    pub async fn produce(&self) -> Result<Produced, AppError> {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        let me = self.node.peer_id();

        for peer in self.node.peers_of(&self.file_topic) {
            match self.node.connections().peer_info(&peer) {
                Some(info) => info!("👥 peer: {} ({})", peer, info.remote_addr),
                None => info!("👥 peer: {}", peer),
            }
        }

        let file = self
            .node
            .content()
            .add(format!("{} ipfs file #{}", me, round).into_bytes())
            .await?;
        info!("💾 saved file: {}", file);
        self.node.publish(&self.file_topic, file.to_string())?;

        let dag = self
            .node
            .content()
            .put_value(&json!({ "content": format!("{} ipfs dag #{}", me, round) }))
            .await?;
        info!("💾 saved dag: {}", dag);
        self.node.publish(&self.dag_topic, dag.to_string())?;

        Ok(Produced { round, file, dag })
    }

    /// Produce every interval, first round one interval after start.
    pub async fn run(&self) {
        let cancel = self.node.cancel_token();
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.produce().await {
                        warn!("⚠️  Producer round failed: {}", e);
                    }
                }
            }
        }
        debug!("🛑 Producer loop stopped");
    }
}
