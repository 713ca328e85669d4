//! Concurrent map of live flows

use crate::flow::{Flow, FlowKey};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Single source of truth for whether a flow exists.
///
/// Shared by the dispatcher and the event loop for one VPN session.
#[derive(Default)]
pub struct FlowRegistry {
    flows: DashMap<FlowKey, Arc<Flow>>,
    collisions: AtomicU64,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &FlowKey) -> Option<Arc<Flow>> {
        self.flows.get(key).map(|entry| entry.value().clone())
    }

    /// Insert a flow under its key.
    ///
    /// An existing entry for the same key is replaced and handed back so the
    /// caller can tear it down. A collision means an earlier flow on the same
    /// 4-tuple was never cleaned up.
    pub fn insert(&self, flow: Arc<Flow>) -> Option<Arc<Flow>> {
        let key = flow.key();
        let previous = self.flows.insert(key, flow);
        if let Some(old) = &previous {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            error!(
                "Flow key collision on {}: flow {} ({}) superseded",
                key,
                old.id(),
                old.status()
            );
        }
        previous
    }

    /// Remove `flow` if it is still the entry registered under its key.
    ///
    /// Returns false when the flow was already removed or superseded.
    pub fn remove(&self, flow: &Arc<Flow>) -> bool {
        let removed = self
            .flows
            .remove_if(&flow.key(), |_, current| Arc::ptr_eq(current, flow))
            .is_some();
        if removed {
            debug!("[{}] {} removed from registry", flow.id(), flow.key());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    pub fn flows(&self) -> Vec<Arc<Flow>> {
        self.flows.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Datagram flows that have carried nothing for longer than `timeout`.
    pub fn idle_datagram_flows(&self, timeout: Duration) -> Vec<Arc<Flow>> {
        self.flows
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .udp()
                    .map(|udp| udp.state().is_timed_out(timeout))
                    .unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Session teardown: close every live flow and empty the map.
    ///
    /// Returns the flows that were closed so their records can be flushed.
    pub fn close_all_and_clear(&self) -> Vec<Arc<Flow>> {
        let keys: Vec<FlowKey> = self.flows.iter().map(|entry| *entry.key()).collect();
        let mut closed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, flow)) = self.flows.remove(&key) {
                flow.force_close();
                closed.push(flow);
            }
        }
        info!("Closed {} flows on teardown", closed.len());
        closed
    }
}
