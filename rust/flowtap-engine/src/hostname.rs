//! Address to hostname cache fed by observed DNS responses

use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use tracing::trace;

pub const DEFAULT_HOSTNAME_CAPACITY: usize = 128;

/// Country-code TLDs that register names under a generic second level.
const SLD_TLDS: &[&str] = &[
    "ag", "at", "bz", "cn", "co", "im", "in", "lc", "mx", "ph", "pl", "sc", "so", "uk", "vc",
];
const SLD_LABELS: &[&str] = &[
    "com", "net", "org", "co", "nom", "or", "ind", "gen", "firm", "l", "p", "info", "biz", "me",
];

/// Fixed-capacity map evicting the least recently *inserted* address.
///
/// Lookups never refresh an entry, and re-inserting an address only updates
/// its hostname.
pub struct HostnameCache {
    hosts: Mutex<LruCache<IpAddr, String>>,
}

impl HostnameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            hosts: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, addr: IpAddr, hostname: String) {
        let mut hosts = self.hosts.lock();
        if let Some(existing) = hosts.peek_mut(&addr) {
            *existing = hostname;
            return;
        }
        trace!("hostname cache: {} -> {}", addr, hostname);
        hosts.put(addr, hostname);
    }

    pub fn find(&self, addr: &IpAddr) -> Option<String> {
        self.hosts.lock().peek(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }
}

impl Default for HostnameCache {
    fn default() -> Self {
        Self::new(DEFAULT_HOSTNAME_CAPACITY)
    }
}

/// Registrable part of a hostname, e.g. `example.com` for
/// `www.example.com` or `bbc.co.uk` for `news.bbc.co.uk`.
pub fn pay_level_domain(hostname: &str) -> String {
    let labels: Vec<&str> = hostname.trim_end_matches('.').split('.').collect();
    let n = labels.len();
    if n >= 3 && SLD_TLDS.contains(&labels[n - 1]) && SLD_LABELS.contains(&labels[n - 2]) {
        labels[n - 3..].join(".")
    } else if n >= 2 {
        labels[n - 2..].join(".")
    } else {
        hostname.to_string()
    }
}
