//! Periodic DNS re-resolution of configured peer hostnames.
//!
//! Testbed peers are often named, not numbered, and their addresses can
//! change across restarts. Each sweep resolves every configured name and
//! offers the first address (IPv6 preferred when allowed) to the neighbor
//! manager as an update. The send must not block: during a startup burst
//! the manager may be busy handshaking, and a blocked resolver would hold
//! the whole sweep hostage.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::peer::{NeighborEvent, NeighborUpdate};
use super::types::{
    RESOLUTION_INTERVAL_SECS, STARTUP_INTERVAL_SECS, STARTUP_RESOLUTION_INTERVAL_SECS,
};
use crate::node::Node;

pub async fn run(
    node: Arc<Node>,
    neighbor_names: Vec<String>,
    v4_ok: bool,
    v6_ok: bool,
    token: CancellationToken,
) {
    if neighbor_names.is_empty() {
        return;
    }
    let start_time = Instant::now();
    loop {
        debug!("resolver awake");
        for name in &neighbor_names {
            let address = match resolve(name, v4_ok, v6_ok).await {
                Some(address) => address,
                None => continue,
            };
            if node.neighbors().read().await.contains_key(&address) {
                continue;
            }
            let update = NeighborUpdate::bare(address);
            match node.events_tx().try_send(NeighborEvent::Update(update)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("dropping update for neighbor {address} as queue would block");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
        // Sweep more often for a while after launch: the whole cluster may
        // have just started too, and we want things going quickly.
        let sleep_time = if start_time.elapsed() >= Duration::from_secs(STARTUP_INTERVAL_SECS) {
            RESOLUTION_INTERVAL_SECS
        } else {
            STARTUP_RESOLUTION_INTERVAL_SECS
        };
        debug!("resolver asleep");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(Duration::from_secs(sleep_time)) => {}
        }
    }
}

/// First resolved address for a name: IPv6 when allowed, then IPv4.
async fn resolve(name: &str, v4_ok: bool, v6_ok: bool) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = match lookup_host((name, 0u16)).await {
        Ok(addrs) => addrs.map(|sa| sa.ip()).collect(),
        Err(e) => {
            debug!("{name} resolution raised {e}");
            return None;
        }
    };
    if v6_ok {
        if let Some(address) = addrs.iter().find(|a| a.is_ipv6()) {
            return Some(*address);
        }
    }
    if v4_ok {
        if let Some(address) = addrs.iter().find(|a| a.is_ipv4()) {
            return Some(*address);
        }
    }
    None
}
