//! Flow records and write-behind persistence
//!
//! The forwarding path never talks to the store directly. Flows whose
//! counters or attribution change are staged in a [`WriteBehindCache`] and a
//! [`BatchWriter`] task upserts fresh snapshots on a fixed interval.

use crate::error::{EngineError, Result};
use crate::flow::{Flow, Protocol};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Persisted subset of a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: u64,
    pub session_id: u64,
    pub app_package: Option<String>,
    pub hostname: Option<String>,
    pub pay_level_domain: Option<String>,
    /// Creation time, unix milliseconds
    pub timestamp: i64,
    /// Milliseconds, -1 while the flow is active
    pub duration: i64,
    pub ip_version: u8,
    pub protocol: String,
    pub port: u16,
    pub is_active: bool,
    pub is_tls: bool,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub payload_bytes_in: u64,
    pub payload_bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

impl FlowRecord {
    pub fn from_flow(flow: &Flow) -> Self {
        let attribution = flow.attribution();
        let stats = flow.stats().snapshot();
        let created = flow.created_at();
        let (is_active, duration) = match flow.ended_at() {
            Some(end) => (false, (end - created).num_milliseconds()),
            None => (true, -1),
        };

        Self {
            flow_id: flow.id(),
            session_id: flow.session_id(),
            app_package: attribution.app_package,
            hostname: attribution.hostname,
            pay_level_domain: attribution.pay_level_domain,
            timestamp: created.timestamp_millis(),
            duration,
            ip_version: 4,
            protocol: match flow.protocol() {
                Protocol::Tcp => "TCP".to_string(),
                Protocol::Udp => "UDP".to_string(),
            },
            port: flow.remote().port(),
            is_active,
            is_tls: flow.is_tls(),
            total_bytes_in: stats.total_bytes_in,
            total_bytes_out: stats.total_bytes_out,
            payload_bytes_in: stats.payload_bytes_in,
            payload_bytes_out: stats.payload_bytes_out,
            packets_in: stats.packets_in,
            packets_out: stats.packets_out,
        }
    }
}

/// Persistence consumed by the engine.
pub trait FlowStore: Send + Sync {
    /// Persist a new record and return its id (never 0).
    fn insert(&self, record: &FlowRecord) -> Result<u64>;

    fn upsert_batch(&self, records: &[FlowRecord]) -> Result<()>;
}

/// In-process store, the default when the host provides none.
#[derive(Default)]
pub struct MemoryFlowStore {
    next_id: AtomicU64,
    records: RwLock<HashMap<u64, FlowRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u64) -> Option<FlowRecord> {
        self.records.read().get(&id).cloned()
    }

    pub fn records(&self) -> Vec<FlowRecord> {
        let mut records: Vec<FlowRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.flow_id);
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl FlowStore for MemoryFlowStore {
    fn insert(&self, record: &FlowRecord) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut record = record.clone();
        record.flow_id = id;
        self.records.write().insert(id, record);
        Ok(id)
    }

    fn upsert_batch(&self, records: &[FlowRecord]) -> Result<()> {
        let mut map = self.records.write();
        for record in records {
            if record.flow_id == 0 {
                return Err(EngineError::Store("record without id".to_string()));
            }
            map.insert(record.flow_id, record.clone());
        }
        Ok(())
    }
}

/// Flows waiting for the next flush, keyed by flow id.
///
/// Staging an already pending flow is a no-op: the record is snapshotted at
/// flush time, so it picks up every change made in between.
#[derive(Default)]
pub struct WriteBehindCache {
    pending: Mutex<HashMap<u64, Arc<Flow>>>,
}

impl WriteBehindCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, flow: &Arc<Flow>) {
        let id = flow.id();
        if id == 0 {
            return;
        }
        self.pending.lock().entry(id).or_insert_with(|| flow.clone());
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take a snapshot of every pending flow and clear the cache.
    pub fn drain(&self) -> Vec<FlowRecord> {
        let pending = std::mem::take(&mut *self.pending.lock());
        pending.values().map(|flow| FlowRecord::from_flow(flow)).collect()
    }

    /// Upsert everything pending into `store`.
    pub fn flush(&self, store: &dyn FlowStore) -> Result<usize> {
        let records = self.drain();
        if records.is_empty() {
            return Ok(0);
        }
        store.upsert_batch(&records)?;
        trace!("Flushed {} flow records", records.len());
        Ok(records.len())
    }
}

/// Periodic flush task; a final flush runs when it is stopped.
pub struct BatchWriter {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BatchWriter {
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        cache: Arc<WriteBehindCache>,
        store: Arc<dyn FlowStore>,
        period: Duration,
    ) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.flush(store.as_ref()) {
                            warn!("Flow record flush failed: {}", e);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            match cache.flush(store.as_ref()) {
                Ok(n) => debug!("Final flush wrote {} flow records", n),
                Err(e) => warn!("Final flow record flush failed: {}", e),
            }
        });
        Self { shutdown, handle }
    }

    /// Signal the task to stop; the returned handle completes after the
    /// final flush.
    pub fn stop(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tests::{tcp_flow, udp_packet, client_addr};
    use crate::flow::FlowStatus;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn persisted(store: &MemoryFlowStore) -> Arc<Flow> {
        let flow = Arc::new(tcp_flow());
        let id = store.insert(&FlowRecord::from_flow(&flow)).unwrap();
        flow.set_id(id);
        flow
    }

    #[test]
    fn test_record_mirrors_flow() {
        let flow = tcp_flow();
        flow.stats().record_out(60, 20);
        flow.stats().record_in(1500, 1460);
        let record = FlowRecord::from_flow(&flow);
        assert_eq!(record.protocol, "TCP");
        assert_eq!(record.port, 80);
        assert!(record.is_active);
        assert!(!record.is_tls);
        assert_eq!(record.duration, -1);
        assert_eq!(record.ip_version, 4);
        assert_eq!(record.payload_bytes_out, 20);
        assert_eq!(record.total_bytes_in, 1500);
        assert_eq!(record.packets_in, 1);
    }

    #[test]
    fn test_terminal_record_is_inactive() {
        let flow = tcp_flow();
        flow.transition(FlowStatus::Aborted).unwrap();
        let record = FlowRecord::from_flow(&flow);
        assert!(!record.is_active);
        assert!(record.duration >= 0);
    }

    #[test]
    fn test_udp_record() {
        let dst = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
        let flow = Flow::from_packet(&udp_packet(client_addr(), dst, b"quic"), 3, 1500);
        let record = FlowRecord::from_flow(&flow);
        assert_eq!(record.protocol, "UDP");
        assert!(record.is_tls);
        assert_eq!(record.session_id, 3);
    }

    #[test]
    fn test_cache_snapshots_at_flush() {
        let store = MemoryFlowStore::new();
        let cache = WriteBehindCache::new();
        let flow = persisted(&store);

        cache.stage(&flow);
        flow.stats().record_out(100, 60);
        cache.stage(&flow);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.flush(&store).unwrap(), 1);
        assert!(cache.is_empty());
        assert_eq!(store.get(flow.id()).unwrap().payload_bytes_out, 60);
        assert_eq!(cache.flush(&store).unwrap(), 0);
    }

    #[test]
    fn test_unpersisted_flow_not_staged() {
        let cache = WriteBehindCache::new();
        cache.stage(&Arc::new(tcp_flow()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_memory_store_assigns_ids() {
        let store = MemoryFlowStore::new();
        let a = store.insert(&FlowRecord::from_flow(&tcp_flow())).unwrap();
        let b = store.insert(&FlowRecord::from_flow(&tcp_flow())).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(store.records().len(), 2);

        let mut orphan = FlowRecord::from_flow(&tcp_flow());
        orphan.flow_id = 0;
        assert!(store.upsert_batch(&[orphan]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_writer_flushes_periodically_and_on_stop() {
        let store = Arc::new(MemoryFlowStore::new());
        let cache = Arc::new(WriteBehindCache::new());
        let flow = persisted(&store);

        let writer = BatchWriter::spawn(
            &tokio::runtime::Handle::current(),
            cache.clone(),
            store.clone(),
            Duration::from_millis(1000),
        );

        flow.stats().record_out(40, 0);
        cache.stage(&flow);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.get(flow.id()).unwrap().packets_out, 1);

        flow.stats().record_out(40, 0);
        flow.transition(FlowStatus::Aborted).unwrap();
        cache.stage(&flow);
        writer.stop().await.unwrap();

        let record = store.get(flow.id()).unwrap();
        assert_eq!(record.packets_out, 2);
        assert!(!record.is_active);
    }
}
