//! Domestic route table.
//!
//! Loads a list of IPv4 networks (one `<address>/<prefix>` per line) and
//! answers whether an address falls inside any of them.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnetwork::Ipv4Network;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::error::RouteError;

/// Networks longer than this go to the overflow list instead of a
/// first-byte bucket.
const MAX_BUCKETED_PREFIX: u8 = 24;

/// Route table bucketed by the first byte of each network address.
pub struct RouteTable {
    buckets: FxHashMap<u8, Vec<Ipv4Network>>,
    overflow: Vec<Ipv4Network>,
}

impl RouteTable {
    /// Read and parse a route table file.
    pub fn load(path: &Path) -> Result<Self, RouteError> {
        let text = fs::read_to_string(path).map_err(|source| RouteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_text(&text);

        info!(path = %path.display(), routes = table.len(), "Route table loaded");

        Ok(table)
    }

    /// Parse route table text.
    ///
    /// Lines that do not start with a digit are comments or headers. Lines
    /// that start with a digit but do not parse as a network are skipped.
    pub fn from_text(text: &str) -> Self {
        let mut buckets: FxHashMap<u8, Vec<Ipv4Network>> = FxHashMap::default();
        let mut overflow = Vec::new();
        let mut skipped = 0usize;

        for line in text.lines().map(str::trim) {
            if !line.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }

            let Some(network) = parse_network(line) else {
                skipped += 1;
                continue;
            };

            if network.prefix() <= MAX_BUCKETED_PREFIX {
                let first_byte = network.network().octets()[0];
                buckets.entry(first_byte).or_default().push(network);
            } else {
                overflow.push(network);
            }
        }

        if skipped > 0 {
            warn!(skipped, "Skipped malformed route table lines");
        }

        Self { buckets, overflow }
    }

    /// Whether `ip` falls inside a domestic network.
    ///
    /// Only the bucket for the address's first byte is searched when one
    /// exists; the overflow list is searched only when there is no such
    /// bucket. IPv6 addresses are never domestic.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.contains_v4(v4),
            IpAddr::V6(_) => false,
        }
    }

    fn contains_v4(&self, ip: Ipv4Addr) -> bool {
        let candidates = self
            .buckets
            .get(&ip.octets()[0])
            .unwrap_or(&self.overflow);

        candidates.iter().any(|network| network.contains(ip))
    }

    /// Number of networks in the table.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum::<usize>() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_network(line: &str) -> Option<Ipv4Network> {
    let (addr, prefix) = line.split_once('/')?;
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;

    Ipv4Network::new(addr, prefix).ok()
}
