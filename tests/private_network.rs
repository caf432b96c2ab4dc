//! Multi-node tests over loopback TCP.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use swarmd::config::{Config, OrchestratorConfig};
use swarmd::content::MemoryBlockStore;
use swarmd::gossip::{GossipMessage, MessageHandler};
use swarmd::identity::{Identity, PeerId};
use swarmd::network::addr::PeerAddr;
use swarmd::network::connection_manager::PeerEvent;
use swarmd::network::pnet::PreSharedKey;
use swarmd::network::secure_channel::SecureChannelError;
use swarmd::node::Node;
use swarmd::orchestrator::{Orchestrator, Retrieved};
use swarmd::AppError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "ipfsfilemsg";

async fn start_node(psk: &PreSharedKey, tweak: impl FnOnce(&mut Config)) -> (Arc<Node>, SocketAddr) {
    let mut config = Config::default();
    config.network.listen_address = "127.0.0.1:0".to_string();
    config.network.handshake_timeout_secs = 2;
    config.network.fetch_timeout_secs = 2;
    config.pubsub.heartbeat_interval_ms = 100;
    config.storage.backend = "memory".to_string();
    tweak(&mut config);
    let node = Arc::new(Node::new(
        config,
        Identity::generate(),
        psk.clone(),
        Arc::new(MemoryBlockStore::new()),
        CancellationToken::new(),
    ));
    let addr = node.start().await.unwrap();
    (node, addr)
}

fn multiaddr(addr: SocketAddr, peer: PeerId) -> String {
    format!("/ip4/{}/tcp/{}/p2p/{}", addr.ip(), addr.port(), peer)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn channel_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<GossipMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |message: &GossipMessage| {
        let _ = tx.send(message.clone());
    });
    (handler, rx)
}

#[tokio::test]
async fn test_hello_between_two_nodes() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;

    let (handler, mut received) = channel_handler();
    a.subscribe(TOPIC, handler).unwrap();

    let dialed = b.dial(&a_addr.to_string()).await.unwrap();
    assert_eq!(dialed, a.peer_id());
    wait_until("A in B's topic peers", || b.peers_of(TOPIC).contains(&a.peer_id())).await;
    assert!(a.list_peers().contains(&b.peer_id()));

    b.publish(TOPIC, "hello").unwrap();
    let message = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.origin, b.peer_id());
    assert_eq!(message.data, b"hello");
    assert_eq!(message.topic, TOPIC);

    // Delivered exactly once.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), received.recv())
            .await
            .is_err()
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_publisher_order_preserved_over_tcp() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;

    let (handler, mut received) = channel_handler();
    a.subscribe(TOPIC, handler).unwrap();
    b.dial(&a_addr.to_string()).await.unwrap();
    wait_until("A in B's topic peers", || b.peers_of(TOPIC).contains(&a.peer_id())).await;

    const COUNT: usize = 50;
    for i in 0..COUNT {
        b.publish(TOPIC, format!("msg-{}", i)).unwrap();
    }

    let mut seqnos = Vec::with_capacity(COUNT);
    for i in 0..COUNT {
        let message = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.origin, b.peer_id());
        assert_eq!(message.data, format!("msg-{}", i).into_bytes());
        seqnos.push(message.seqno);
    }
    assert!(seqnos.windows(2).all(|w| w[0] < w[1]));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_wrong_swarm_key_is_never_admitted() {
    let (a, a_addr) = start_node(&PreSharedKey::generate(), |_| {}).await;
    let (c, _) = start_node(&PreSharedKey::generate(), |_| {}).await;
    let (_listener, mut events) = a.connections().subscribe_events();

    let result = c.dial(&a_addr.to_string()).await;
    assert!(matches!(result, Err(AppError::Pnet(_))), "got {:?}", result);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.list_peers().contains(&c.peer_id()));
    assert!(a.list_peers().is_empty());
    assert!(c.list_peers().is_empty());
    assert!(events.try_recv().is_err());

    a.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn test_expected_peer_id_mismatch_rejected() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;
    let (_a_listener, mut a_events) = a.connections().subscribe_events();
    let (_b_listener, mut b_events) = b.connections().subscribe_events();

    let impostor = Identity::generate().peer_id();
    let addr = multiaddr(a_addr, impostor);
    assert_eq!(addr.parse::<PeerAddr>().unwrap().peer_id, Some(impostor));

    let result = b.dial(&addr).await;
    assert!(
        matches!(
            result,
            Err(AppError::SecureChannel(SecureChannelError::AuthenticationFailed(_)))
        ),
        "got {:?}",
        result
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.list_peers().is_empty());
    assert!(b.list_peers().is_empty());
    assert!(a_events.try_recv().is_err());
    assert!(b_events.try_recv().is_err());

    // The right PeerId on the same address is accepted.
    assert_eq!(b.dial(&multiaddr(a_addr, a.peer_id())).await.unwrap(), a.peer_id());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_redial_of_connected_peer_is_noop() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;

    let addr = multiaddr(a_addr, a.peer_id());
    assert_eq!(b.dial(&addr).await.unwrap(), a.peer_id());
    assert_eq!(b.dial(&addr).await.unwrap(), a.peer_id());
    assert_eq!(b.connections().connected_count(), 1);
    wait_until("B registered on A", || a.list_peers().contains(&b.peer_id())).await;
    assert_eq!(a.connections().connected_count(), 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_disconnect_clears_roster_and_topics() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;
    let (c, _) = start_node(&psk, |_| {}).await;
    let (_listener, mut events) = a.connections().subscribe_events();

    let (handler, _rx) = channel_handler();
    b.subscribe(TOPIC, handler.clone()).unwrap();
    c.subscribe(TOPIC, handler).unwrap();
    b.dial(&a_addr.to_string()).await.unwrap();
    c.dial(&a_addr.to_string()).await.unwrap();
    wait_until("both peers on A's topic", || a.peers_of(TOPIC).len() == 2).await;

    b.shutdown();
    wait_until("B gone from A", || !a.list_peers().contains(&b.peer_id())).await;
    let expected: HashSet<PeerId> = [c.peer_id()].into_iter().collect();
    assert_eq!(a.peers_of(TOPIC), expected);
    assert!(a.list_peers().contains(&c.peer_id()));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let b_events: Vec<&PeerEvent> = seen
        .iter()
        .filter(|e| match e {
            PeerEvent::Connected { peer, .. } | PeerEvent::Disconnected { peer } => {
                *peer == b.peer_id()
            }
        })
        .collect();
    assert_eq!(b_events.len(), 2);
    assert!(matches!(b_events[0], PeerEvent::Connected { .. }));
    assert!(matches!(b_events[1], PeerEvent::Disconnected { .. }));

    a.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn test_chunked_file_fetched_from_peer() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |config| config.storage.chunk_size = 1024).await;
    b.dial(&a_addr.to_string()).await.unwrap();
    wait_until("B known to A's gossip", || {
        a.gossip().connected_peers().contains(&b.peer_id())
    })
    .await;

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    let cid = b.content().add(data.clone()).await.unwrap();
    assert!(!a.content().has(&cid).await.unwrap());

    a.fetch(&cid, &[b.peer_id()]).await.unwrap();
    let chunks: Vec<bytes::Bytes> = {
        use futures_util::TryStreamExt;
        a.content().cat(&cid).try_collect().await.unwrap()
    };
    assert_eq!(chunks.concat(), data);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_orchestrators_exchange_file_and_dag() {
    let psk = PreSharedKey::generate();
    let (a, a_addr) = start_node(&psk, |_| {}).await;
    let (b, _) = start_node(&psk, |_| {}).await;
    let config = OrchestratorConfig::default();

    let (tx, mut retrieved) = mpsc::unbounded_channel();
    let receiver = Arc::new(Orchestrator::new(a.clone(), &config).with_observer(tx));
    let _handlers = receiver.spawn_handlers().unwrap();
    let producer = Orchestrator::new(b.clone(), &config);

    b.dial(&a_addr.to_string()).await.unwrap();
    wait_until("A on both topics", || {
        b.peers_of(&config.file_topic).contains(&a.peer_id())
            && b.peers_of(&config.dag_topic).contains(&a.peer_id())
    })
    .await;

    let produced = producer.produce().await.unwrap();
    let mut results = Vec::new();
    for _ in 0..2 {
        results.push(
            tokio::time::timeout(Duration::from_secs(5), retrieved.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }

    let file = format!("{} ipfs file #0", b.peer_id());
    let dag = serde_json::json!({ "content": format!("{} ipfs dag #0", b.peer_id()) });
    assert!(results.contains(&Retrieved::File {
        from: b.peer_id(),
        cid: produced.file,
        content: file,
    }));
    assert!(results.contains(&Retrieved::Dag {
        from: b.peer_id(),
        cid: produced.dag,
        value: dag,
    }));

    a.shutdown();
    b.shutdown();
}
