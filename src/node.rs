//! Shared node state: the store, the neighbor map, the MPR set, the ignore
//! list, the cancel-scope registry, and the flood engine.
//!
//! Mutation of the neighbor map itself (insert/remove) belongs to the
//! neighbor-manager task; sender tasks only flip their own entry's
//! availability and swap its queue, and the flood engine iterates over a
//! snapshot so the manager can mutate concurrently.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net::manager;
use crate::net::peer::{Neighbor, NeighborEvent};
use crate::net::reader;
use crate::net::resolver;
use crate::net::types::{IGNORE_INTERVAL_SECS, NEIGHBOR_EVENT_QUEUE_LIMIT, OUTBOUND_QUEUE_LIMIT};
use crate::net::wire::{Record, RelayMessage};
use crate::net::{mpr, sender};
use crate::store::Storage;
use crate::util::now;
use crate::{http, seeds::Seeds};

pub struct Node {
    pub config: Config,
    store: Mutex<Storage>,
    neighbors: RwLock<HashMap<IpAddr, Neighbor>>,
    mpr: Mutex<Option<HashSet<IpAddr>>>,
    /// Addresses suppressed until the stored instant (epoch seconds).
    ignored_peers: Mutex<HashMap<IpAddr, u64>>,
    /// Cancel scopes registered per peer address; cancelling a peer fires
    /// them all so its reader and sender unwind together.
    cancel_scopes: Mutex<HashMap<IpAddr, Vec<(u64, CancellationToken)>>>,
    next_scope_id: AtomicU64,
    connected_neighbors: AtomicUsize,
    /// Coalescing wake signal from the manager to the neighbor notifier.
    pub wake_notifier: Notify,
    events_tx: mpsc::Sender<NeighborEvent>,
    pub seeds: Seeds,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(config: Config, seeds: Seeds) -> (Arc<Self>, mpsc::Receiver<NeighborEvent>) {
        let (events_tx, events_rx) = mpsc::channel(NEIGHBOR_EVENT_QUEUE_LIMIT);
        let node = Arc::new(Self {
            config,
            store: Mutex::new(Storage::default()),
            neighbors: RwLock::new(HashMap::new()),
            mpr: Mutex::new(Some(HashSet::new())),
            ignored_peers: Mutex::new(HashMap::new()),
            cancel_scopes: Mutex::new(HashMap::new()),
            next_scope_id: AtomicU64::new(1),
            connected_neighbors: AtomicUsize::new(0),
            wake_notifier: Notify::new(),
            events_tx,
            seeds,
            shutdown: CancellationToken::new(),
        });
        (node, events_rx)
    }

    pub fn store(&self) -> &Mutex<Storage> {
        &self.store
    }

    pub fn neighbors(&self) -> &RwLock<HashMap<IpAddr, Neighbor>> {
        &self.neighbors
    }

    pub fn events_tx(&self) -> &mpsc::Sender<NeighborEvent> {
        &self.events_tx
    }

    pub fn connected_neighbors(&self) -> usize {
        self.connected_neighbors.load(Ordering::SeqCst)
    }

    pub fn add_connected(&self) {
        self.connected_neighbors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sub_connected(&self) {
        self.connected_neighbors.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_me(&self, address: &IpAddr) -> bool {
        self.config.me.contains(address)
    }

    pub async fn is_ignored(&self, address: &IpAddr) -> bool {
        match self.ignored_peers.lock().await.get(address) {
            Some(until) => now() < *until,
            None => false,
        }
    }

    pub async fn peer_allowed(&self, address: &IpAddr) -> bool {
        !self.is_ignored(address).await
    }

    /// Suppress an address for the ignore TTL.
    pub async fn ignore_peer(&self, address: IpAddr) {
        self.ignored_peers
            .lock()
            .await
            .insert(address, now() + IGNORE_INTERVAL_SECS);
    }

    /// Drop ignore entries whose expiry has passed.
    pub async fn purge_ignored(&self, now: u64) {
        self.ignored_peers
            .lock()
            .await
            .retain(|_, until| *until > now);
    }

    // -------------------------------------------------------------------------
    // Cancel scopes
    // -------------------------------------------------------------------------

    /// Register a cancel scope for a peer address. The returned token is a
    /// child of the node-wide shutdown token, so shutdown reaches every
    /// peer task too.
    pub async fn register_scope(&self, address: IpAddr) -> (u64, CancellationToken) {
        let id = self.next_scope_id.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        self.cancel_scopes
            .lock()
            .await
            .entry(address)
            .or_default()
            .push((id, token.clone()));
        (id, token)
    }

    pub async fn unregister_scope(&self, address: IpAddr, id: u64) {
        let mut scopes = self.cancel_scopes.lock().await;
        if let Some(entries) = scopes.get_mut(&address) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                scopes.remove(&address);
            }
        }
    }

    /// Fire every scope registered for the address.
    pub async fn cancel_peer(&self, address: IpAddr) {
        if let Some(entries) = self.cancel_scopes.lock().await.remove(&address) {
            for (_, token) in entries {
                token.cancel();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Neighbor map helpers used by the sender
    // -------------------------------------------------------------------------

    pub async fn set_available(&self, address: IpAddr, available: bool) {
        if let Some(neighbor) = self.neighbors.write().await.get_mut(&address) {
            neighbor.available = available;
        }
    }

    /// Tear down and replace a neighbor's outbound queue, flushing anything
    /// still queued. Returns the new receiver for the sender to drain, or
    /// None when the neighbor is gone.
    pub async fn replace_queue(&self, address: IpAddr) -> Option<mpsc::Receiver<Record>> {
        let mut neighbors = self.neighbors.write().await;
        let neighbor = neighbors.get_mut(&address)?;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LIMIT);
        neighbor.queue = Some(tx);
        Some(rx)
    }

    /// Ask the manager to delete a neighbor. True if it is currently known.
    pub async fn delete_neighbor(&self, address: IpAddr) -> bool {
        if !self.neighbors.read().await.contains_key(&address) {
            return false;
        }
        if self
            .events_tx
            .send(NeighborEvent::Delete(address))
            .await
            .is_err()
        {
            warn!("neighbor manager gone; cannot delete {address}");
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // MPR
    // -------------------------------------------------------------------------

    /// Recompute the MPR set from the available neighbors.
    pub async fn compute_mpr(&self) {
        if self.config.no_mpr {
            *self.mpr.lock().await = None;
            return;
        }
        let one_hop: HashMap<IpAddr, HashSet<IpAddr>> = self
            .neighbors
            .read()
            .await
            .values()
            .filter(|n| n.available)
            .map(|n| (n.address, n.neighbors.clone()))
            .collect();
        let updated = mpr::compute(&one_hop, self.config.host);
        info!("mpr updated to {:?}", updated);
        *self.mpr.lock().await = updated;
    }

    // -------------------------------------------------------------------------
    // Flood engine
    // -------------------------------------------------------------------------

    /// Inject a record into the overlay. Relay records are deduplicated
    /// through the store; the returned pair is the assigned sequence number
    /// and whether the message was new. Neighbor beacons flow through the
    /// same fan-out but are always fully broadcast.
    ///
    /// `originator` is the peer the record arrived from, skipped on fan-out
    /// so it is not echoed back.
    pub async fn inject(&self, message: Record, originator: Option<IpAddr>) -> (u64, bool) {
        let mut seqno = 0;
        let mut created = true;
        let want_broadcast = match &message {
            Record::Relay(relay) => {
                let mut db = self.store.lock().await;
                let result = db.add(relay.clone(), now());
                seqno = result.seq;
                created = result.created;
                if result.created {
                    relay.broadcast
                } else {
                    db.claim_broadcast(result.seq, relay.broadcast)
                }
            }
            Record::Neighbors(_) => true,
            Record::Handshake(_) => {
                debug_assert!(false, "handshake records are never injected");
                false
            }
        };
        if let Record::Relay(relay) = &message {
            debug!("inject {} broadcast = {}", relay.key(), want_broadcast);
        }
        if !want_broadcast {
            return (seqno, created);
        }

        // Sending can block on a full queue and the manager may mutate the
        // map meanwhile, so fan out over a snapshot.
        let targets: Vec<(IpAddr, mpsc::Sender<Record>)> = self
            .neighbors
            .read()
            .await
            .values()
            .filter(|n| Some(n.address) != originator)
            .filter_map(|n| n.queue.clone().map(|q| (n.address, q)))
            .collect();
        let mpr = self.mpr.lock().await.clone();
        for (address, queue) in targets {
            let out_message = match &message {
                Record::Relay(relay) => {
                    // the broadcast flag tells this neighbor whether it is
                    // an MPR-selected relay for the message
                    let do_broadcast = match &mpr {
                        _ if self.config.no_mpr => true,
                        None => true,
                        Some(set) => set.contains(&address),
                    };
                    Record::Relay(RelayMessage::new(relay.payload().clone(), do_broadcast))
                }
                other => other.clone(),
            };
            if queue.send(out_message).await.is_err() {
                // queue torn down during reconnect; the message will be
                // re-advertised by the next beacon or flood
                debug!("{address} outbound queue closed during inject");
            }
        }
        (seqno, created)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn every long-lived task: HTTP surface, peer listener, neighbor
    /// manager, notifier, purger, and DNS resolver. Returns once listeners
    /// are bound; failures to bind are startup errors.
    pub async fn start(
        self: &Arc<Self>,
        events_rx: mpsc::Receiver<NeighborEvent>,
        resolver_names: Vec<String>,
        initial_neighbors: Vec<IpAddr>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.config.host, self.config.port)).await?;
        info!("listening for peers on {}", listener.local_addr()?);
        let http_listener = TcpListener::bind((self.config.host, self.config.http_port)).await?;
        info!("serving http on {}", http_listener.local_addr()?);

        tokio::spawn(http::serve(
            self.clone(),
            http_listener,
            self.shutdown.child_token(),
        ));
        tokio::spawn(reader::listen(
            self.clone(),
            listener,
            self.shutdown.child_token(),
        ));
        tokio::spawn(manager::neighbor_maintenance(
            self.clone(),
            events_rx,
            self.shutdown.child_token(),
        ));
        tokio::spawn(manager::neighbor_notifier(
            self.clone(),
            self.shutdown.child_token(),
        ));
        tokio::spawn(manager::periodic_purger(
            self.clone(),
            self.shutdown.child_token(),
        ));
        tokio::spawn(resolver::run(
            self.clone(),
            resolver_names,
            true,
            self.config.v6_ok,
            self.shutdown.child_token(),
        ));

        for address in initial_neighbors {
            let update = crate::net::peer::NeighborUpdate::bare(address);
            if self
                .events_tx
                .send(NeighborEvent::Update(update))
                .await
                .is_err()
            {
                warn!("neighbor manager gone during startup");
            }
        }
        Ok(())
    }

    /// Spawn one sender task for a newly created neighbor.
    pub async fn spawn_sender(self: &Arc<Self>, address: IpAddr, rx: mpsc::Receiver<Record>) {
        let (scope_id, token) = self.register_scope(address).await;
        tokio::spawn(sender::run(self.clone(), address, rx, scope_id, token));
    }

    /// Cancel the whole task tree.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
