//! Runtime configuration: command-line flags with environment overrides.
//!
//! An environment variable wins over its corresponding flag when set, so
//! containerized deployments can configure a node without touching its
//! command line.

use std::collections::HashSet;
use std::net::IpAddr;

use clap::Parser;
use thiserror::Error;

use crate::net::types::{BEBO_PORT, HTTP_PORT};
use crate::util::{get_boolean_env, get_int_env, hostify, my_addresses};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "bebo", version, about = "bebo server")]
pub struct Args {
    /// The address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    pub address: String,

    /// The port to peer on
    #[arg(short, long, default_value_t = BEBO_PORT)]
    pub port: u16,

    /// The port to serve HTTP on
    #[arg(short = 'P', long, default_value_t = HTTP_PORT)]
    pub http_port: u16,

    /// bebo neighbors
    #[arg(value_name = "SERVER")]
    pub neighbors: Vec<String>,

    /// Number of neighbors to choose randomly from the seed set
    #[arg(short, long, default_value_t = 2)]
    pub choose: usize,

    /// JSON URL or filename with neighbor seeds information
    #[arg(short, long, default_value = "")]
    pub seeds: String,

    #[arg(short, long)]
    pub debug: bool,

    /// Disable the MPR optimization
    #[arg(short = 'M', long)]
    pub no_mpr: bool,

    #[arg(short = 'H', long)]
    pub hex_mode: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved listen/identity address.
    pub host: IpAddr,
    pub port: u16,
    pub http_port: u16,
    pub debug: bool,
    pub hex_mode: bool,
    pub no_mpr: bool,
    pub v6_ok: bool,
    /// Addresses that count as ourselves.
    pub me: HashSet<IpAddr>,
}

impl Config {
    /// Resolve flags plus environment into a runnable configuration.
    pub async fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let debug = get_boolean_env("DEBUG", args.debug);
        let address = std::env::var("ADDRESS").unwrap_or_else(|_| args.address.clone());
        let port = get_int_env("PORT", args.port).map_err(ConfigError::Invalid)?;
        let http_port = get_int_env("HTTP_PORT", args.http_port).map_err(ConfigError::Invalid)?;
        let hex_mode = get_boolean_env("HEX_MODE", args.hex_mode);
        let no_mpr = get_boolean_env("NO_MPR", args.no_mpr);
        let v6_ok = get_boolean_env("V6_OK", true);
        let host = hostify(&address, true, v6_ok)
            .await
            .map_err(ConfigError::Invalid)?;
        let me = my_addresses(host);
        Ok(Self {
            host,
            port,
            http_port,
            debug,
            hex_mode,
            no_mpr,
            v6_ok,
            me,
        })
    }
}
