//! Multi-point relay selection.
//!
//! Out of our available 1-hop neighbors, pick a subset that still covers
//! every strict 2-hop neighbor. Only selected neighbors are asked to
//! re-broadcast, which prunes redundant floods across dense meshes. The
//! greedy cover comes from OLSR: force in any neighbor that is the sole
//! route to some 2-hop node, then repeatedly take the neighbor covering the
//! most of what remains.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::debug;

/// Compute the MPR set over the available 1-hop neighborhood.
///
/// `one_hop` maps each available neighbor to its advertised neighbor set;
/// `host` is our own address, which never counts as a 2-hop neighbor.
///
/// `None` means "do not suppress": every available neighbor relays. That is
/// the result whenever there are no strict 2-hop neighbors to cover.
pub fn compute(one_hop: &HashMap<IpAddr, HashSet<IpAddr>>, host: IpAddr) -> Option<HashSet<IpAddr>> {
    // The strict two-hop set: neighbors of our neighbors, minus our own
    // neighbors, minus ourselves. Track who covers each two-hop node while
    // building it.
    let mut strict_two_hop: HashSet<IpAddr> = HashSet::new();
    let mut neighbors_of: HashMap<IpAddr, Vec<IpAddr>> = HashMap::new();
    for (address, advertised) in one_hop {
        for two_hop in advertised {
            strict_two_hop.insert(*two_hop);
            neighbors_of.entry(*two_hop).or_default().push(*address);
        }
    }
    for address in one_hop.keys() {
        strict_two_hop.remove(address);
    }
    strict_two_hop.remove(&host);
    debug!("strict two-hop {:?}", strict_two_hop);

    let mut mpr: HashSet<IpAddr> = HashSet::new();

    // Nodes with a single coverer force that coverer into the MPR; its whole
    // advertised set is then covered and drops out of the work list.
    let mut remove: HashSet<IpAddr> = HashSet::new();
    for two_hop in &strict_two_hop {
        let coverers = &neighbors_of[two_hop];
        if coverers.len() == 1 {
            let sole = coverers[0];
            debug_assert!(one_hop.contains_key(&sole));
            debug!("mpr add sole coverer {}", sole);
            mpr.insert(sole);
            remove.insert(*two_hop);
            remove.extend(one_hop[&sole].iter().copied());
        }
    }
    strict_two_hop.retain(|address| !remove.contains(address));

    // Greedy cover over whatever is left. Ties break on iteration order.
    while !strict_two_hop.is_empty() {
        let mut max_node: Option<IpAddr> = None;
        let mut max_covered: HashSet<IpAddr> = HashSet::new();
        for (address, advertised) in one_hop {
            if mpr.contains(address) {
                continue;
            }
            let covered: HashSet<IpAddr> = advertised
                .intersection(&strict_two_hop)
                .copied()
                .collect();
            if covered.len() > max_covered.len() {
                max_covered = covered;
                max_node = Some(*address);
            }
        }
        // Every remaining two-hop node has at least one coverer by
        // construction, so the greedy step always finds a candidate.
        let max_node = match max_node {
            Some(address) => address,
            None => unreachable!("uncoverable two-hop neighbors: {strict_two_hop:?}"),
        };
        debug!("mpr add max coverage {} {:?}", max_node, max_covered);
        mpr.insert(max_node);
        strict_two_hop.retain(|address| !max_covered.contains(address));
    }

    if mpr.is_empty() {
        None
    } else {
        Some(mpr)
    }
}
