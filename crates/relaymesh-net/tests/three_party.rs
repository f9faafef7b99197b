//! End-to-end relayed connections between in-process nodes

use rand::seq::SliceRandom;
use rand::Rng;
use relaymesh_core::{ConnectionId, Envelope, PeerId};
use relaymesh_net::{
    Connection, Frame, HandlerState, MemoryRegistry, MessageChannel, PeerHandle, PeerRegistry,
    RegistryError, RelayError, RelayEvent, RelayedConnectionHandler, Switchboard,
    SwitchboardConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

struct Node {
    registry: Arc<MemoryRegistry>,
    switchboard: Switchboard,
}

impl Node {
    fn new(id: &str, config: SwitchboardConfig) -> Self {
        let registry = Arc::new(MemoryRegistry::new(peer(id)));
        let switchboard = Switchboard::new(registry.clone(), config);
        Self {
            registry,
            switchboard,
        }
    }
}

/// Bidirectional in-memory link; each side dispatches what the other sends
struct Link {
    a_side: Arc<dyn MessageChannel>,
    b_side: Arc<dyn MessageChannel>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn close(&self) {
        self.a_side.close();
        self.b_side.close();
    }
}

fn connect(a: &Node, b: &Node) -> Link {
    let (to_b, from_a) = Connection::with_queue(b.registry.local_peer().clone(), 64);
    let (to_a, from_b) = Connection::with_queue(a.registry.local_peer().clone(), 64);
    let a_side: Arc<dyn MessageChannel> = Arc::new(to_b);
    let b_side: Arc<dyn MessageChannel> = Arc::new(to_a);
    a.registry.attach(a_side.clone());
    b.registry.attach(b_side.clone());
    let tasks = vec![
        b.switchboard.spawn_dispatch(b_side.clone(), from_a),
        a.switchboard.spawn_dispatch(a_side.clone(), from_b),
    ];
    Link {
        a_side,
        b_side,
        tasks,
    }
}

struct Mesh {
    alice: Node,
    relay: Node,
    bob: Node,
    alice_relay: Link,
    relay_bob: Link,
}

fn mesh(config: SwitchboardConfig) -> Mesh {
    let alice = Node::new("alice", config.clone());
    let relay = Node::new("relay-1", config.clone());
    let bob = Node::new("bob", config);
    let alice_relay = connect(&alice, &relay);
    let relay_bob = connect(&relay, &bob);
    Mesh {
        alice,
        relay,
        bob,
        alice_relay,
        relay_bob,
    }
}

fn fast_config() -> SwitchboardConfig {
    SwitchboardConfig {
        handshake_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(2),
        ..Default::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_round_trip_through_relay() {
    let m = mesh(fast_config());
    let mut bob_events = m.bob.switchboard.subscribe();

    let started = Instant::now();
    let channel = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(channel.is_open());
    assert_eq!(channel.remote(), &peer("bob"));
    assert!(m.alice.switchboard.pending().is_empty());

    // Destination bound the connection before answering
    let bob_channel = match bob_events.recv().await.unwrap() {
        RelayEvent::Established {
            remote,
            connection_id,
            initiator,
        } => {
            assert_eq!(remote, peer("alice"));
            assert_eq!(connection_id, channel.connection_id());
            assert!(!initiator);
            m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap()
        }
        other => panic!("unexpected event {:?}", other),
    };
    let mut at_bob = bob_channel.take_incoming().unwrap();
    let mut at_alice = channel.take_incoming().unwrap();

    channel.send(b"hello bob").await.unwrap();
    assert_eq!(at_bob.recv().await.unwrap(), b"hello bob".to_vec());

    bob_channel.send_data(b"hello alice").await.unwrap();
    assert_eq!(at_alice.recv().await.unwrap(), b"hello alice".to_vec());

    assert!(m.relay.switchboard.is_acting_as_relay());
    let counter = m.relay.switchboard.transfer_counter();
    eventually(|| counter.messages() == 2).await;
    assert_eq!(counter.bytes(), 9 + 11);
}

#[tokio::test]
async fn test_data_order_preserved() {
    let m = mesh(fast_config());
    let channel = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    eventually(|| m.bob.registry.node(&peer("alice")).and_then(|n| n.relayed()).is_some()).await;
    let bob_handler = m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap();
    let mut incoming = bob_handler.take_incoming().unwrap();

    for i in 0..100u32 {
        channel.send(&i.to_be_bytes()).await.unwrap();
    }
    for i in 0..100u32 {
        assert_eq!(incoming.recv().await.unwrap(), i.to_be_bytes().to_vec());
    }
}

#[tokio::test]
async fn test_close_propagates_eof() {
    let m = mesh(fast_config());
    let channel = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    eventually(|| m.bob.registry.node(&peer("alice")).and_then(|n| n.relayed()).is_some()).await;
    let bob_handler = m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap();

    channel.close();
    assert_eq!(channel.handler().state(), HandlerState::Closed);
    eventually(|| bob_handler.state() == HandlerState::Closed).await;
    assert!(!m.bob.registry.node(&peer("alice")).unwrap().is_fully_connected());
}

#[tokio::test]
async fn test_unconnected_destination_nacked() {
    let m = mesh(fast_config());
    let carol = Node::new("carol", fast_config());
    let mut carol_events = carol.switchboard.subscribe();

    let err = m.alice.switchboard.open_relayed_connection(&peer("carol")).await.unwrap_err();
    assert!(matches!(err, RelayError::Nack(ref p) if p == &peer("carol")));
    assert!(m.alice.switchboard.pending().is_empty());
    assert!(carol_events.try_recv().is_err());
}

#[tokio::test]
async fn test_destination_refusal_nacked() {
    let alice = Node::new("alice", fast_config());
    let relay = Node::new("relay-1", fast_config());
    let bob = Node::new(
        "bob",
        SwitchboardConfig {
            relayed_connections: false,
            ..fast_config()
        },
    );
    let _alice_relay = connect(&alice, &relay);
    let _relay_bob = connect(&relay, &bob);

    let err = alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap_err();
    assert!(matches!(err, RelayError::Nack(ref p) if p == &peer("bob")));
    assert!(alice.switchboard.pending().is_empty());
    assert!(bob.switchboard.pending().is_empty());
    assert!(bob.registry.node(&peer("alice")).and_then(|n| n.relayed()).is_none());
}

#[tokio::test]
async fn test_second_open_refused_while_connected() {
    let m = mesh(fast_config());
    let first = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    eventually(|| m.bob.registry.node(&peer("alice")).and_then(|n| n.relayed()).is_some()).await;

    let err = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::Registry(RegistryError::AlreadyConnected(ref p)) if p == &peer("bob")
    ));
    assert!(m.alice.switchboard.pending().is_empty());
    assert!(first.is_open());
    let bound = m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap();
    assert_eq!(bound.connection_id(), first.connection_id());
}

#[tokio::test]
async fn test_reopen_after_relay_link_loss() {
    let m = mesh(fast_config());
    let first = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    eventually(|| m.bob.registry.node(&peer("alice")).and_then(|n| n.relayed()).is_some()).await;
    let stale = m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap();

    // The relay keeps no per-connection state, so bob never hears about this
    m.alice_relay.close();
    m.alice.registry.detach(&m.alice_relay.a_side);
    m.relay.registry.detach(&m.alice_relay.b_side);
    m.alice.switchboard.link_closed(&m.alice_relay.a_side);
    m.relay.switchboard.link_closed(&m.alice_relay.b_side);
    assert!(!first.is_open());
    assert!(stale.is_connected());

    let _relinked = connect(&m.alice, &m.relay);
    let second = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();
    assert_ne!(second.connection_id(), first.connection_id());
    assert_eq!(stale.state(), HandlerState::Closed);

    let current = m.bob.registry.node(&peer("alice")).unwrap().relayed().unwrap();
    assert_eq!(current.connection_id(), second.connection_id());
    let mut at_bob = current.take_incoming().unwrap();
    second.send(b"again").await.unwrap();
    assert_eq!(at_bob.recv().await.unwrap(), b"again".to_vec());
}

#[tokio::test]
async fn test_timeout_when_destination_silent() {
    let m = mesh(SwitchboardConfig {
        handshake_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    });
    // Bob's side of the link stops dispatching, so the SYN goes unanswered
    for task in &m.relay_bob.tasks {
        task.abort();
    }
    let (silent, _keep) = Connection::with_queue(peer("bob"), 64);
    m.relay.registry.attach(Arc::new(silent));

    let err = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap_err();
    match err {
        RelayError::Timeout { peer: p, waited } => {
            assert_eq!(p, peer("bob"));
            assert!(waited >= Duration::from_millis(100));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(m.alice.switchboard.pending().is_empty());
}

#[tokio::test]
async fn test_no_relay_and_loopback() {
    let alice = Node::new("alice", fast_config());
    let bob = Node::new("bob", fast_config());
    let _direct = connect(&alice, &bob);

    assert!(matches!(
        alice.switchboard.open_relayed_connection(&peer("bob")).await,
        Err(RelayError::NoRelay(_))
    ));
    assert!(matches!(
        alice.switchboard.open_relayed_connection(&peer("alice")).await,
        Err(RelayError::Loopback(_))
    ));
    assert!(alice.switchboard.pending().is_empty());
}

#[tokio::test]
async fn test_relay_link_loss_fails_handshake() {
    let m = mesh(fast_config());
    m.alice_relay.close();

    let err = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap_err();
    assert!(matches!(err, RelayError::NoRelay(_)));
}

#[tokio::test]
async fn test_duplicate_ack_is_idempotent() {
    let m = mesh(fast_config());
    let channel = m.alice.switchboard.open_relayed_connection(&peer("bob")).await.unwrap();

    let ack = Envelope::ack(peer("bob"), peer("alice"), channel.connection_id());
    m.alice.switchboard.handle_envelope(&m.alice_relay.a_side, ack).await;
    assert_eq!(channel.handler().state(), HandlerState::Connected);
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_admission_limit_refuses_handshake() {
    let m = mesh(SwitchboardConfig {
        max_pending: Some(0),
        ..fast_config()
    });
    assert!(matches!(
        m.alice.switchboard.open_relayed_connection(&peer("bob")).await,
        Err(RelayError::TooManyPending(0))
    ));
}

#[tokio::test]
async fn test_shutdown_fails_open_in_progress() {
    let m = mesh(SwitchboardConfig {
        handshake_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    });
    for task in &m.relay_bob.tasks {
        task.abort();
    }
    let (silent, _keep) = Connection::with_queue(peer("bob"), 64);
    m.relay.registry.attach(Arc::new(silent));

    let switchboard = m.alice.switchboard.clone();
    let open = tokio::spawn(async move { switchboard.open_relayed_connection(&peer("bob")).await });
    eventually(|| m.alice.switchboard.pending_count() == 1).await;

    m.alice.switchboard.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(1), open).await.unwrap().unwrap();
    assert!(matches!(result, Err(RelayError::ConnectionBroken(_))));
    assert!(m.alice.switchboard.pending().is_empty());
}

fn random_envelopes(count: usize, sources: &[&str]) -> Vec<(Envelope, bool)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let source = peer(sources.choose(&mut rng).unwrap());
            let id = ConnectionId(rng.gen_range(0..6));
            let envelope = match rng.gen_range(0..5) {
                0 => Envelope::syn(source, peer("bob"), id),
                1 => Envelope::ack(source, peer("bob"), id),
                2 => Envelope::nack(source, peer("bob"), id),
                3 => Envelope::eof(source, peer("bob"), id),
                _ => Envelope::data(source, peer("bob"), id, vec![0; rng.gen_range(0..64)]).unwrap(),
            };
            (envelope, rng.gen_bool(0.25))
        })
        .collect()
}

/// Remember every handler visible in the pending table or bound to a peer
fn track(node: &Node, peers: &[&str], seen: &mut Vec<Arc<RelayedConnectionHandler>>) {
    let mut found = node.switchboard.pending().snapshot();
    found.extend(
        peers
            .iter()
            .filter_map(|p| node.registry.node(&peer(p)))
            .filter_map(|n| n.relayed()),
    );
    for handler in found {
        if !seen.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            seen.push(handler);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_invariant_under_random_injection() {
    let local = Node::new(
        "bob",
        SwitchboardConfig {
            handshake_timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        },
    );
    let peers = ["alice", "carol", "erin", "frank"];

    // Two relay links dispatching concurrently; what bob sends on them is discarded
    let mut work: Vec<JoinHandle<()>> = Vec::new();
    for relay in ["relay-1", "relay-2"] {
        let (link, mut sent) = Connection::with_queue(peer(relay), 1024);
        let link: Arc<dyn MessageChannel> = Arc::new(link);
        local.registry.attach(link.clone());
        tokio::spawn(async move { while sent.recv().await.is_some() {} });

        let (tx, rx) = mpsc::channel::<Frame>(1024);
        work.push(local.switchboard.spawn_dispatch(link, rx));
        let envelopes = random_envelopes(600, &peers);
        work.push(tokio::spawn(async move {
            for (envelope, pause) in envelopes {
                tx.send(Frame::relay(&envelope).unwrap()).await.unwrap();
                if pause {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }));
    }

    // Outbound opens keep initiator handlers in play; injected ACK/NACK/EOF may hit them
    for destination in ["carol", "erin", "frank"] {
        let switchboard = local.switchboard.clone();
        work.push(tokio::spawn(async move {
            for _ in 0..4 {
                let _ = switchboard.open_relayed_connection(&peer(destination)).await;
            }
        }));
    }

    let mut seen = Vec::new();
    while !work.iter().all(|task| task.is_finished()) {
        track(&local, &peers, &mut seen);
        let wrong = local.switchboard.pending().inconsistent(&seen);
        assert!(wrong.is_empty(), "pending table out of step with {:?}", wrong);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for task in work {
        task.await.unwrap();
    }

    track(&local, &peers, &mut seen);
    assert!(seen.iter().any(|h| h.is_initiator()));
    assert!(seen.iter().any(|h| !h.is_initiator()));
    eventually(|| local.switchboard.pending().is_empty()).await;
    assert!(local.switchboard.pending().inconsistent(&seen).is_empty());
    assert!(seen.iter().all(|h| !h.state().is_pending()));
}
