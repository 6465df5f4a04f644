//! Multi-node behaviour over the in-memory network: discovery, connection
//! facts, resilience to garbage on the topic, and re-convergence after a
//! partition heals.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dswarm::{
    connection_subject, Address, Category, Envelope, FactKey, MemoryHub, Message, NodeId,
    SwarmConfig, SwarmNode, TimeInterval, Timestamp,
};
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SwarmConfig {
    SwarmConfig {
        discovery_interval: Duration::from_millis(50),
        lookup_timeout: Duration::from_millis(40),
        connect_timeout: Duration::from_millis(200),
        broadcast_read_timeout: Duration::from_millis(50),
        rebroadcast_interval: Duration::from_millis(50),
        rebroadcast_min_delta: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn start(hub: &Arc<MemoryHub>, config: &SwarmConfig) -> SwarmNode {
    SwarmNode::spawn(Arc::new(hub.join().await), config.clone())
        .await
        .expect("node should start")
}

fn remote_propose(subject: &str) -> Envelope {
    Envelope::new(
        Address::brain(NodeId::random()),
        Address::all_brains(),
        Message::propose(
            FactKey::new(Category::new(["test"]), subject),
            TimeInterval::starting_at(Timestamp::now(), Duration::from_secs(60)),
            None,
        ),
    )
}

#[tokio::test]
async fn two_nodes_record_a_connection() {
    let hub = MemoryHub::new();
    let config = fast_config();
    let a = start(&hub, &config).await;
    let b = start(&hub, &config).await;

    let forward = connection_subject(a.id(), b.id());
    let backward = connection_subject(b.id(), a.id());
    let (node, forward, backward) = (&a, &forward, &backward);
    eventually("a connection fact on A", move || async move {
        let summary = node.summary().await.unwrap();
        summary.contains("connections", forward) || summary.contains("connections", backward)
    })
    .await;

    let peers = a.query("peer").await.unwrap();
    assert!(peers.iter().any(|f| f.key.subject == b.id().to_hex()));
    assert!(peers.iter().all(|f| f.key.subject != a.id().to_hex()));

    a.shutdown().await;
    b.shutdown().await;
}

async fn has_connection(node: &SwarmNode, a: NodeId, b: NodeId) -> bool {
    let live = node.query("connections").await.unwrap();
    let subjects = [connection_subject(a, b), connection_subject(b, a)];
    live.iter().any(|f| subjects.contains(&f.key.subject))
}

#[tokio::test]
async fn failed_dial_is_retried_once_the_link_heals() {
    let hub = MemoryHub::new();
    hub.set_connect_latency(Duration::from_millis(500)).await;
    let config = SwarmConfig {
        connect_timeout: Duration::from_millis(50),
        peer_validity: Duration::from_millis(600),
        ..fast_config()
    };
    let a = start(&hub, &config).await;
    let b = start(&hub, &config).await;

    sleep(Duration::from_millis(400)).await;
    assert!(hub.connections().await.is_empty());
    assert!(!has_connection(&a, a.id(), b.id()).await);

    hub.set_connect_latency(Duration::ZERO).await;
    let (node, ids) = (&a, (a.id(), b.id()));
    eventually("a connection fact after the link healed", move || async move {
        has_connection(node, ids.0, ids.1).await
    })
    .await;
    assert!(!hub.connections().await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn facts_about_healthy_nodes_outlive_their_windows() {
    let hub = MemoryHub::new();
    let config = SwarmConfig {
        peer_validity: Duration::from_millis(600),
        connection_validity: Duration::from_millis(400),
        address_validity: Duration::from_millis(300),
        ..fast_config()
    };
    let a = start(&hub, &config).await;
    let b = start(&hub, &config).await;

    let (node, ids) = (&a, (a.id(), b.id()));
    eventually("a first connection fact", move || async move {
        has_connection(node, ids.0, ids.1).await
    })
    .await;

    // several connection, peer and address windows
    sleep(Duration::from_millis(1500)).await;
    assert!(has_connection(&a, a.id(), b.id()).await);
    let peers = a.query("peer").await.unwrap();
    assert!(peers.iter().any(|f| f.key.subject == b.id().to_hex()));
    let addresses = a.query(&format!("pri/{}/addresses", b.id())).await.unwrap();
    assert!(!addresses.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn malformed_line_between_valid_envelopes_is_skipped() {
    let hub = MemoryHub::new();
    let config = fast_config();
    let a = start(&hub, &config).await;

    hub.inject(&config.topic, remote_propose("first").encode()).await;
    hub.inject(&config.topic, b"{\"maddr_from\": \"/dswarm/x/brain\", \"contents\"".to_vec()).await;
    hub.inject(&config.topic, remote_propose("second").encode()).await;

    let node = &a;
    eventually("both valid facts", move || async move {
        node.query("test").await.unwrap().len() == 2
    })
    .await;
    assert_eq!(a.telemetry().await.gossip.malformed, 1);

    a.shutdown().await;
}

#[tokio::test]
async fn three_nodes_converge_on_peer_facts() {
    let hub = MemoryHub::new();
    let config = fast_config();
    let nodes = vec![
        start(&hub, &config).await,
        start(&hub, &config).await,
        start(&hub, &config).await,
    ];
    let ids: Vec<String> = nodes.iter().map(|n| n.id().to_hex()).collect();

    for node in &nodes {
        let ids = &ids;
        eventually("every node to learn every peer", move || async move {
            let summary = node.summary().await.unwrap();
            ids.iter().all(|id| summary.contains("peer", id))
        })
        .await;
    }

    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn partitioned_node_catches_up_after_healing() {
    let hub = MemoryHub::new();
    let config = fast_config();
    let a = start(&hub, &config).await;
    let b = start(&hub, &config).await;

    hub.set_reachable(a.id(), false).await;
    a.router().send(remote_propose("while-partitioned")).await;

    let node = &a;
    eventually("A to hold the fact locally", move || async move {
        node.query("test").await.unwrap().len() == 1
    })
    .await;
    sleep(Duration::from_millis(200)).await;
    assert!(b.query("test").await.unwrap().is_empty());

    hub.set_reachable(a.id(), true).await;
    let node = &b;
    eventually("B to receive the rebroadcast", move || async move {
        node.query("test").await.unwrap().len() == 1
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn duplicated_broadcasts_do_not_inflate_caches() {
    let hub = MemoryHub::new();
    hub.set_duplicate_broadcasts(true).await;
    let config = fast_config();
    let a = start(&hub, &config).await;

    let envelope = remote_propose("once");
    hub.inject(&config.topic, envelope.encode()).await;
    hub.inject(&config.topic, envelope.encode()).await;

    let node = &a;
    eventually("the fact to arrive", move || async move {
        node.query("test").await.unwrap().len() == 1
    })
    .await;
    let snapshot = a.brain().snapshot().await.unwrap();
    let key = FactKey::new(Category::new(["test"]), "once");
    assert!(snapshot.contains(&key));
    assert_eq!(a.query("test").await.unwrap().len(), 1);

    a.shutdown().await;
}
