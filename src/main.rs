//! bebo — whiteboard relay/gossip overlay.
//!
//! Floods opaque binary messages across a dynamic mesh of TCP-connected
//! nodes, deduplicating by content hash and pruning redundant broadcasts
//! with OLSR-style multi-point relays. An HTTP API injects, retrieves, and
//! manages neighbors.

use std::net::IpAddr;

use clap::Parser;
use tracing::{error, info};

use bebo::config::{Args, Config};
use bebo::node::Node;
use bebo::seeds::Seeds;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Decide where the first peers come from: explicit neighbors beat the
/// NEIGHBORS environment, which beats a randomly sampled seed set.
async fn initial_neighbors(args: &Args, host: &str) -> Result<(Vec<String>, Seeds), String> {
    if !args.neighbors.is_empty() {
        return Ok((args.neighbors.clone(), Seeds::empty()));
    }
    if let Ok(text) = std::env::var("NEIGHBORS") {
        let neighbors = text
            .replace(' ', "")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        return Ok((neighbors, Seeds::empty()));
    }
    let seeds_text = if !args.seeds.is_empty() {
        Some(args.seeds.clone())
    } else if let Ok(text) = std::env::var("SEEDS") {
        let text = text.replace(' ', "");
        // a bare host list gets the list: scheme tacked on
        if text.contains(':') {
            Some(text)
        } else {
            Some(format!("list:{text}"))
        }
    } else {
        None
    };
    match seeds_text {
        Some(text) => {
            let seeds = Seeds::load(&text, Some(host))
                .await
                .map_err(|e| e.to_string())?;
            let chosen = seeds.choose(args.choose);
            Ok((chosen, seeds))
        }
        None => Ok((Vec::new(), Seeds::empty())),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::resolve(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("bebo: {e}");
            std::process::exit(2);
        }
    };

    let directive = if config.debug { "bebo=debug" } else { "bebo=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap()),
        )
        .init();

    info!("starting bebo {}", VERSION);

    let host_text = config.host.to_string();
    let (initial, seeds) = match initial_neighbors(&args, &host_text).await {
        Ok(result) => result,
        Err(e) => {
            error!("bad seeds configuration: {e}");
            std::process::exit(2);
        }
    };

    // Literal addresses go straight to the neighbor manager; names are the
    // DNS resolver's problem.
    let mut initial_addresses = Vec::new();
    let mut peer_names = Vec::new();
    for peer in &initial {
        match peer.parse::<IpAddr>() {
            Ok(address) => initial_addresses.push(address),
            Err(_) => peer_names.push(peer.clone()),
        }
    }
    info!(
        "v6_ok = {}, initial neighbors = {:?}, peer names = {:?}",
        config.v6_ok, initial, peer_names
    );

    let (node, events_rx) = Node::new(config, seeds);
    if let Err(e) = node.start(events_rx, peer_names, initial_addresses).await {
        error!("failed to start node: {e}");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    node.shutdown();
}
