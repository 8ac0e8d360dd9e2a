//! Outbound side of a peer link: one sender task per neighbor, for the
//! lifetime of that neighbor.
//!
//! The loop dials with the local source address bound to our published host
//! (testbeds co-locate many node identities on loopback aliases, and the OS
//! default source address would be the wrong identity), handshakes, then
//! drains the neighbor's outbound queue. On disconnect the queue is torn
//! down and replaced, dropping unsent records, and the dial retries with
//! exponential backoff.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::reader::handshake;
use super::types::{INITIAL_BACKOFF_SECS, MAX_BACKOFF_SECS};
use super::wire::{self, Record};
use crate::node::Node;

/// Keeps the node-wide connected count correct even when the task is
/// cancelled mid-connection.
struct ConnectedGuard<'a> {
    node: &'a Node,
}

impl<'a> ConnectedGuard<'a> {
    fn new(node: &'a Node) -> Self {
        node.add_connected();
        Self { node }
    }
}

impl Drop for ConnectedGuard<'_> {
    fn drop(&mut self) {
        self.node.sub_connected();
    }
}

pub async fn run(
    node: Arc<Node>,
    address: IpAddr,
    rx: mpsc::Receiver<Record>,
    scope_id: u64,
    token: CancellationToken,
) {
    debug!("neighbor {address} sender starting");
    tokio::select! {
        _ = token.cancelled() => {}
        _ = sender_loop(&node, address, rx) => {}
    }
    node.unregister_scope(address, scope_id).await;
    debug!("neighbor {address} sender finished");
}

async fn sender_loop(node: &Arc<Node>, address: IpAddr, mut rx: mpsc::Receiver<Record>) {
    let mut backoff = INITIAL_BACKOFF_SECS;
    loop {
        match dial(node.config.host, address, node.config.port).await {
            Ok(mut stream) => {
                backoff = INITIAL_BACKOFF_SECS;
                info!("neighbor {address} connected");
                match handshake(&mut stream, None).await {
                    Some(error) => {
                        debug!("neighbor {address} handshake error {error}");
                        node.delete_neighbor(address).await;
                        return;
                    }
                    None => {
                        let _connected = ConnectedGuard::new(node);
                        node.set_available(address, true).await;
                        drain(&mut stream, &mut rx, address).await;
                        info!("neighbor {address} disconnected");
                    }
                }
            }
            Err(e) => {
                debug!("neighbor {address} connection failed ({e}), backoff = {backoff}");
            }
        }
        node.set_available(address, false).await;
        node.compute_mpr().await;
        // swap in a fresh queue rather than draining the old one: draining
        // could never finish while producers keep writing
        rx = match node.replace_queue(address).await {
            Some(rx) => rx,
            None => return,
        };
        sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}

/// Dial `(address, port)` from a socket bound to our published host.
async fn dial(host: IpAddr, address: IpAddr, port: u16) -> std::io::Result<TcpStream> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.bind(SocketAddr::new(host, 0))?;
    socket.connect(SocketAddr::new(address, port)).await
}

/// Forward queued records until the link or the queue dies.
async fn drain(stream: &mut TcpStream, rx: &mut mpsc::Receiver<Record>, address: IpAddr) {
    while let Some(record) = rx.recv().await {
        debug!("neighbor {address} sending {record:?}");
        if let Err(e) = wire::write_record(stream, &record).await {
            debug!("neighbor {address} send failed: {e}");
            break;
        }
    }
}
