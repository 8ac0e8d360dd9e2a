//! Per-neighbor state and the manager's event types.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use tokio::sync::mpsc;

use super::wire::Record;

/// State for one neighbor, keyed by its address in the node's neighbor map.
///
/// The outbound queue sender lives here; the matching receiver is owned by
/// the neighbor's dedicated sender task, which tears the pair down and
/// replaces it on every reconnect so stale broadcasts are dropped rather
/// than head-of-line blocking fresh ones.
pub struct Neighbor {
    pub address: IpAddr,
    /// The neighbor's advertised 1-hop set, already self-filtered.
    pub neighbors: HashSet<IpAddr>,
    pub queue: Option<mpsc::Sender<Record>>,
    /// True only while a handshaken connection is up.
    pub available: bool,
    pub canceled: bool,
}

impl Neighbor {
    pub fn new(address: IpAddr, neighbors: HashSet<IpAddr>) -> Self {
        Self {
            address,
            neighbors,
            queue: None,
            available: false,
            canceled: false,
        }
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "neighbor {}", self.address)
    }
}

/// Advertised state carried by an update event.
#[derive(Debug, Clone)]
pub struct NeighborUpdate {
    pub address: IpAddr,
    pub neighbors: HashSet<IpAddr>,
}

impl NeighborUpdate {
    pub fn new(address: IpAddr, neighbors: HashSet<IpAddr>) -> Self {
        Self { address, neighbors }
    }

    /// An update that announces only the address, for peers discovered from
    /// configuration or DNS before they have advertised anything.
    pub fn bare(address: IpAddr) -> Self {
        Self::new(address, HashSet::new())
    }
}

/// Events consumed by the neighbor-manager loop, strictly in enqueue order.
#[derive(Debug, Clone)]
pub enum NeighborEvent {
    Update(NeighborUpdate),
    Delete(IpAddr),
}
