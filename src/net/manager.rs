//! Neighbor lifecycle: the single-reader maintenance loop, the beacon
//! notifier, and the periodic store purger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::peer::{Neighbor, NeighborEvent, NeighborUpdate};
use super::types::{
    IGNORE_PURGE_INTERVAL_SECS, NEIGHBOR_NOTIFIER_WAKE_TIMEOUT_SECS, OUTBOUND_QUEUE_LIMIT,
    PURGE_INTERVAL_SECS,
};
use super::wire::{NeighborsMessage, Record};
use crate::node::Node;
use crate::util::now;

/// Consume `(update | delete)` events in strict enqueue order. All inserts
/// and removals of neighbor-map entries happen here and nowhere else.
pub async fn neighbor_maintenance(
    node: Arc<Node>,
    mut events: mpsc::Receiver<NeighborEvent>,
    token: CancellationToken,
) {
    let mut last_ignored_purge = 0u64;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let now = now();
        if now.saturating_sub(last_ignored_purge) >= IGNORE_PURGE_INTERVAL_SECS {
            debug!("periodic ignored peers purge");
            node.purge_ignored(now).await;
            last_ignored_purge = now;
        }
        match event {
            NeighborEvent::Delete(address) => {
                {
                    let mut neighbors = node.neighbors().write().await;
                    match neighbors.get_mut(&address) {
                        // already gone or already being torn down
                        None => continue,
                        Some(neighbor) if neighbor.canceled => continue,
                        Some(neighbor) => neighbor.canceled = true,
                    }
                    neighbors.remove(&address);
                }
                info!("deleted neighbor {address}");
                node.cancel_peer(address).await;
                node.ignore_peer(address).await;
                node.wake_notifier.notify_one();
                node.compute_mpr().await;
            }
            NeighborEvent::Update(update) => {
                let mut recompute = true;
                if apply_update(&node, update).await {
                    node.wake_notifier.notify_one();
                } else {
                    // we already know all this
                    recompute = false;
                }
                if recompute {
                    node.compute_mpr().await;
                }
            }
        }
    }
}

/// Apply an update event. Returns whether any state changed.
async fn apply_update(node: &Arc<Node>, update: NeighborUpdate) -> bool {
    let address = update.address;
    let rx = {
        let mut neighbors = node.neighbors().write().await;
        if let Some(existing) = neighbors.get_mut(&address) {
            if existing.neighbors == update.neighbors {
                debug!("neighbor {address} unchanged");
                return false;
            }
            debug!("neighbor {address} changed");
            existing.neighbors = update.neighbors;
            return true;
        }
        info!("new neighbor {address}");
        let mut neighbor = Neighbor::new(address, update.neighbors);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LIMIT);
        neighbor.queue = Some(tx);
        neighbors.insert(address, neighbor);
        rx
    };
    node.spawn_sender(address, rx).await;
    true
}

/// Broadcast our available neighbors at least every
/// [`NEIGHBOR_NOTIFIER_WAKE_TIMEOUT_SECS`], or immediately when the manager
/// signals a change.
pub async fn neighbor_notifier(node: Arc<Node>, token: CancellationToken) {
    loop {
        let wait = timeout(
            Duration::from_secs(NEIGHBOR_NOTIFIER_WAKE_TIMEOUT_SECS),
            node.wake_notifier.notified(),
        );
        tokio::select! {
            _ = token.cancelled() => break,
            _ = wait => {}
        }
        let addresses: Vec<_> = node
            .neighbors()
            .read()
            .await
            .values()
            .filter(|n| n.available)
            .map(|n| n.address)
            .collect();
        debug!("notifying neighbors of {addresses:?}");
        node.inject(Record::Neighbors(NeighborsMessage::new(addresses)), None)
            .await;
    }
}

/// Evict expired and over-limit messages on a fixed cadence.
pub async fn periodic_purger(node: Arc<Node>, token: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(PURGE_INTERVAL_SECS));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                node.store().lock().await.purge(now());
            }
        }
    }
}
