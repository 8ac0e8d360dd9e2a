//! Address, environment, and rendering helpers shared across the crate.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::lookup_host;

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pack an address into its on-wire form: 4 bytes for v4, 16 for v6.
pub fn to_binary_address(address: &IpAddr) -> Vec<u8> {
    match address {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

/// Unpack a wire address. Anything that is not exactly 4 or 16 bytes is
/// not an IP address.
pub fn to_text_address(binary: &[u8]) -> Option<IpAddr> {
    match binary.len() {
        4 => {
            let octets: [u8; 4] = binary.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = binary.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Resolve a host argument to a single address.
///
/// Literal addresses pass through untouched. Names are resolved and the
/// first IPv6 address is preferred when allowed, then the first IPv4.
pub async fn hostify(arg: &str, v4_ok: bool, v6_ok: bool) -> Result<IpAddr, String> {
    if let Ok(address) = arg.parse::<IpAddr>() {
        return Ok(address);
    }
    let addrs: Vec<IpAddr> = lookup_host((arg, 0u16))
        .await
        .map_err(|e| format!("cannot hostify {arg}: {e}"))?
        .map(|sa| sa.ip())
        .collect();
    if v6_ok {
        if let Some(address) = addrs.iter().find(|a| a.is_ipv6()) {
            return Ok(*address);
        }
    }
    if v4_ok {
        if let Some(address) = addrs.iter().find(|a| a.is_ipv4()) {
            return Ok(*address);
        }
    }
    Err(format!("cannot hostify {arg}"))
}

/// The set of addresses that count as "me" for self-connection and
/// self-advertisement filtering.
pub fn my_addresses(host: IpAddr) -> HashSet<IpAddr> {
    let mut addresses = HashSet::new();
    addresses.insert(host);
    addresses
}

/// Boolean environment lookup: set-but-falsy ("false", "no", "0") is false,
/// any other set value is true, unset is the default.
pub fn get_boolean_env(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => !matches!(v.to_lowercase().as_str(), "false" | "no" | "0"),
        _ => default,
    }
}

/// Integer environment lookup. A set-but-unparseable value is a
/// configuration error.
pub fn get_int_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<T>()
            .map_err(|_| format!("environment variable {key} is not a valid integer: {v}")),
        _ => Ok(default),
    }
}

/// JPEG payload sniff: JFIF or Adobe SOI prefixes.
pub fn is_jpeg(data: &[u8]) -> bool {
    data.starts_with(b"\xff\xd8\xff\xe0") || data.starts_with(b"\xff\xd8\xff\xee")
}

/// Classic 16-bytes-per-row hex rendering with a printable annotation column.
pub fn hexdump(binary: &[u8]) -> String {
    let mut all = String::new();
    for (row, chunk) in binary.chunks(16).enumerate() {
        let mut hex = String::new();
        let mut annotation = String::new();
        for b in chunk {
            hex.push_str(&format!("{b:02x} "));
            annotation.push(if (0x20..0x7f).contains(b) {
                *b as char
            } else {
                '.'
            });
        }
        for _ in chunk.len()..16 {
            hex.push_str("   ");
        }
        hex.pop();
        all.push_str(&format!("{:08x} {} {}\n", row * 16, hex, annotation));
    }
    all
}
