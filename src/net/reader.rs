//! Inbound side of a peer link: the listener, the handshake, and the framed
//! record loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::peer::{NeighborEvent, NeighborUpdate};
use super::types::HANDSHAKE_TIMEOUT_SECS;
use super::wire::{self, HandshakeMessage, Record};
use crate::node::Node;

/// Run one side of the bidirectional handshake: send our HANDSHAKE (with
/// `error` populated when we refuse the peering) and read exactly one record
/// back. Returns the peer's error, or a synthesized one when the exchange
/// fails or times out; `None` means the peer accepted us.
pub async fn handshake(stream: &mut TcpStream, error: Option<String>) -> Option<String> {
    let exchange = async {
        let ours = Record::Handshake(HandshakeMessage::new(error));
        wire::write_record(stream, &ours).await?;
        wire::read_record(stream).await
    };
    match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), exchange).await {
        Ok(Ok(Some(Record::Handshake(theirs)))) => theirs.error,
        Ok(Ok(_)) => Some("did not get a return HandshakeMessage".to_string()),
        Ok(Err(e)) => Some(format!("handshake failed: {e}")),
        Err(_) => Some("handshake timed out".to_string()),
    }
}

/// Accept loop on the peer port. Each connection gets its own reader task.
pub async fn listen(node: Arc<Node>, listener: TcpListener, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
                        debug!("{peer} set_keepalive failed: {e}");
                    }
                    tokio::spawn(reader(node.clone(), stream, peer));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

/// Handle one accepted connection: handshake, then dispatch records until
/// the stream ends, errors, or the peer's cancel scope fires.
pub async fn reader(node: Arc<Node>, mut stream: TcpStream, peer: SocketAddr) {
    let address = peer.ip();
    let mut our_error = None;
    if node.is_me(&address) {
        error!("rejecting connection from my own host: {peer}");
        our_error = Some("connection from myself".to_string());
    } else if !node.peer_allowed(&address).await {
        error!("peering not allowed: {peer}");
        our_error = Some("peering not allowed".to_string());
    }
    let their_error = handshake(&mut stream, our_error.clone()).await;
    if our_error.is_some() || their_error.is_some() {
        if let Some(e) = their_error {
            error!("peer handshake error: {peer} {e}");
        }
        return;
    }

    let (scope_id, token) = node.register_scope(address).await;
    info!("{peer} connected");
    tokio::select! {
        _ = token.cancelled() => {}
        _ = read_loop(&node, &mut stream, peer) => {}
    }
    node.unregister_scope(address, scope_id).await;
    info!("{peer} disconnected");
}

async fn read_loop(node: &Arc<Node>, stream: &mut TcpStream, peer: SocketAddr) {
    let address = peer.ip();
    loop {
        match wire::read_record(stream).await {
            Ok(Some(Record::Relay(relay))) => {
                debug!("{peer} received {}", relay.key());
                node.inject(Record::Relay(relay), Some(address)).await;
            }
            Ok(Some(Record::Neighbors(announced))) => {
                // their advertised 1-hop set, minus ourselves; an update,
                // never a replacement, so a running sender is kept
                let neighbors = announced
                    .neighbors
                    .into_iter()
                    .filter(|a| !node.is_me(a))
                    .collect();
                let update = NeighborUpdate::new(address, neighbors);
                if node
                    .events_tx()
                    .send(NeighborEvent::Update(update))
                    .await
                    .is_err()
                {
                    warn!("{peer} neighbor manager gone");
                    break;
                }
            }
            Ok(Some(other)) => {
                error!("unhandled message {other:?} from {peer}");
            }
            Ok(None) => {
                debug!("{peer} EOF");
                break;
            }
            Err(e) => {
                error!("{peer} caught exception {e}");
                break;
            }
        }
    }
}
