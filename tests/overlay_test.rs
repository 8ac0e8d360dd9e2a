//! Peer-wire integration tests: inbound relay injection, handshake
//! refusal, neighbor announcements, and the outbound sender loop.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use bebo::config::Config;
use bebo::net::manager;
use bebo::net::peer::{NeighborEvent, NeighborUpdate};
use bebo::net::reader;
use bebo::net::wire::{self, HandshakeMessage, Record, RelayMessage};
use bebo::node::Node;
use bebo::seeds::Seeds;

fn config(host: &str, port: u16) -> Config {
    let host: IpAddr = host.parse().unwrap();
    Config {
        host,
        port,
        http_port: 0,
        debug: false,
        hex_mode: false,
        no_mpr: false,
        v6_ok: true,
        me: HashSet::from([host]),
    }
}

/// Dial `target` with the local source address bound to `source`, the same
/// way co-located test nodes distinguish their identities.
async fn dial_from(source: &str, target: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket
        .bind(SocketAddr::new(source.parse().unwrap(), 0))
        .unwrap();
    socket.connect(target).await.unwrap()
}

async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn handshake_as_peer(stream: &mut TcpStream) -> Option<String> {
    wire::write_record(stream, &Record::Handshake(HandshakeMessage::new(None)))
        .await
        .unwrap();
    match wire::read_record(stream).await.unwrap() {
        Some(Record::Handshake(h)) => h.error,
        other => panic!("expected a handshake, got {other:?}"),
    }
}

async fn spawn_listener(node: &Arc<Node>) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(reader::listen(
        node.clone(),
        listener,
        CancellationToken::new(),
    ));
    addr
}

#[tokio::test]
async fn inbound_relay_lands_in_store() {
    let (node, _events_rx) = Node::new(config("127.0.0.1", 0), Seeds::empty());
    let addr = spawn_listener(&node).await;

    let mut stream = dial_from("127.0.0.3", addr).await;
    assert_eq!(handshake_as_peer(&mut stream).await, None);

    let relay = RelayMessage::new(&b"hello"[..], true);
    let key = relay.key().to_string();
    wire::write_record(&mut stream, &Record::Relay(relay))
        .await
        .unwrap();

    wait_until(|| {
        node.store()
            .try_lock()
            .map(|db| db.get_by_key(&key).is_some())
            .unwrap_or(false)
    })
    .await;
    let db = node.store().lock().await;
    assert_eq!(db.get_by_key(&key).unwrap().sequence_number, 1);
    assert_eq!(db.next_sequence_number(), 2);
}

#[tokio::test]
async fn ignored_peer_is_refused() {
    let (node, _events_rx) = Node::new(config("127.0.0.1", 0), Seeds::empty());
    node.ignore_peer("127.0.0.3".parse().unwrap()).await;
    let addr = spawn_listener(&node).await;

    let mut stream = dial_from("127.0.0.3", addr).await;
    assert_eq!(
        handshake_as_peer(&mut stream).await.as_deref(),
        Some("peering not allowed")
    );
}

#[tokio::test]
async fn self_connection_is_refused() {
    let (node, _events_rx) = Node::new(config("127.0.0.1", 0), Seeds::empty());
    let addr = spawn_listener(&node).await;

    // no source binding: the connection arrives from 127.0.0.1, which is us
    let mut stream = TcpStream::connect(addr).await.unwrap();
    assert_eq!(
        handshake_as_peer(&mut stream).await.as_deref(),
        Some("connection from myself")
    );
}

#[tokio::test]
async fn neighbors_announcement_updates_manager() {
    let (node, events_rx) = Node::new(config("127.0.0.1", 0), Seeds::empty());
    tokio::spawn(manager::neighbor_maintenance(
        node.clone(),
        events_rx,
        CancellationToken::new(),
    ));
    let addr = spawn_listener(&node).await;

    let mut stream = dial_from("127.0.0.3", addr).await;
    assert_eq!(handshake_as_peer(&mut stream).await, None);

    // our own address must be filtered out of the advertised set
    let announced: Vec<IpAddr> = vec!["10.53.0.9".parse().unwrap(), "127.0.0.1".parse().unwrap()];
    wire::write_record(
        &mut stream,
        &Record::Neighbors(wire::NeighborsMessage::new(announced)),
    )
    .await
    .unwrap();

    let peer: IpAddr = "127.0.0.3".parse().unwrap();
    wait_until(|| {
        node.neighbors()
            .try_read()
            .map(|n| n.contains_key(&peer))
            .unwrap_or(false)
    })
    .await;
    let neighbors = node.neighbors().read().await;
    let entry = neighbors.get(&peer).unwrap();
    assert_eq!(entry.neighbors, HashSet::from(["10.53.0.9".parse().unwrap()]));
    assert!(entry.queue.is_some());
}

#[tokio::test]
async fn delete_installs_ignore_entry() {
    let (node, events_rx) = Node::new(config("127.0.0.1", 0), Seeds::empty());
    tokio::spawn(manager::neighbor_maintenance(
        node.clone(),
        events_rx,
        CancellationToken::new(),
    ));
    let peer: IpAddr = "10.53.0.7".parse().unwrap();
    node.events_tx()
        .send(NeighborEvent::Update(NeighborUpdate::bare(peer)))
        .await
        .unwrap();
    wait_until(|| {
        node.neighbors()
            .try_read()
            .map(|n| n.contains_key(&peer))
            .unwrap_or(false)
    })
    .await;

    assert!(node.delete_neighbor(peer).await);
    wait_until(|| {
        node.neighbors()
            .try_read()
            .map(|n| !n.contains_key(&peer))
            .unwrap_or(false)
    })
    .await;
    // a deleted peer is suppressed for the ignore TTL
    assert!(node.is_ignored(&peer).await);
    assert!(!node.delete_neighbor(peer).await);
}

#[tokio::test]
async fn sender_dials_handshakes_and_floods() {
    let remote = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = remote.local_addr().unwrap().port();

    let (node, events_rx) = Node::new(config("127.0.0.5", port), Seeds::empty());
    tokio::spawn(manager::neighbor_maintenance(
        node.clone(),
        events_rx,
        CancellationToken::new(),
    ));
    let peer: IpAddr = "127.0.0.1".parse().unwrap();
    node.events_tx()
        .send(NeighborEvent::Update(NeighborUpdate::bare(peer)))
        .await
        .unwrap();

    let (mut stream, dialer) = remote.accept().await.unwrap();
    // the sender must bind its published identity, not the OS default
    assert_eq!(dialer.ip(), "127.0.0.5".parse::<IpAddr>().unwrap());
    match wire::read_record(&mut stream).await.unwrap() {
        Some(Record::Handshake(h)) => assert_eq!(h.error, None),
        other => panic!("expected a handshake, got {other:?}"),
    }
    wire::write_record(&mut stream, &Record::Handshake(HandshakeMessage::new(None)))
        .await
        .unwrap();

    wait_until(|| node.connected_neighbors() == 1).await;

    let (seq, created) = node
        .inject(Record::Relay(RelayMessage::new(&b"flood me"[..], true)), None)
        .await;
    assert_eq!((seq, created), (1, true));
    // duplicate: same sequence number, nothing new transmitted
    let (seq, created) = node
        .inject(Record::Relay(RelayMessage::new(&b"flood me"[..], true)), None)
        .await;
    assert_eq!((seq, created), (1, false));
    let (seq, created) = node
        .inject(Record::Relay(RelayMessage::new(&b"second"[..], true)), None)
        .await;
    assert_eq!((seq, created), (2, true));

    match wire::read_record(&mut stream).await.unwrap() {
        Some(Record::Relay(relay)) => {
            assert_eq!(relay.payload().as_ref(), b"flood me");
            // no 2-hop neighborhood yet, so nothing is suppressed
            assert!(relay.broadcast);
        }
        other => panic!("expected a relay, got {other:?}"),
    }
    match wire::read_record(&mut stream).await.unwrap() {
        Some(Record::Relay(relay)) => assert_eq!(relay.payload().as_ref(), b"second"),
        other => panic!("expected a relay, got {other:?}"),
    }
}
