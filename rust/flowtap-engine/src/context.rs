//! Services shared by the dispatcher and the event loop

use crate::config::EngineConfig;
use crate::error::Result;
use crate::flow::{Flow, FlowStatus};
use crate::hostname::HostnameCache;
use crate::metadata::MetadataCollector;
use crate::protect::SocketProtector;
use crate::registry::FlowRegistry;
use crate::selector::Selector;
use crate::stats::EngineStats;
use crate::store::{FlowRecord, FlowStore, WriteBehindCache};
use crate::writer::TunnelSink;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EngineContext {
    pub config: EngineConfig,
    pub registry: Arc<FlowRegistry>,
    pub selector: Arc<Selector>,
    pub sink: TunnelSink,
    pub hostnames: Arc<HostnameCache>,
    pub cache: Arc<WriteBehindCache>,
    pub store: Arc<dyn FlowStore>,
    pub metadata: Arc<MetadataCollector>,
    pub protector: SocketProtector,
    pub stats: Arc<EngineStats>,
    pub runtime: tokio::runtime::Handle,
}

impl EngineContext {
    /// Queue a packet for the tunnel.
    pub fn send(&self, packet: Bytes) {
        if let Err(e) = self.sink.send(packet) {
            warn!("Dropping outbound packet: {}", e);
        }
    }

    /// Queue a packet synthesised for `flow`, counting it as inbound traffic.
    pub fn send_to_client(&self, flow: &Arc<Flow>, packet: Bytes, payload_len: usize) {
        if !flow.is_dns() {
            flow.stats().record_in(packet.len(), payload_len);
            self.cache.stage(flow);
        }
        self.send(packet);
    }

    /// Persist a freshly created flow and start resolving its owner.
    pub fn track(&self, flow: &Arc<Flow>) {
        if flow.is_dns() {
            return;
        }
        match self.store.insert(&FlowRecord::from_flow(flow)) {
            Ok(id) => flow.set_id(id),
            Err(e) => {
                warn!("{} not persisted: {}", flow.key(), e);
                return;
            }
        }
        self.metadata.spawn(&self.runtime, flow.clone());
    }

    /// Abort a flow, answering the client with a reset.
    pub fn abort(&self, flow: &Arc<Flow>, reason: &str) {
        self.abort_flow(flow, true, reason);
    }

    /// Abort a flow whose client side is already gone or superseded.
    pub fn abort_quietly(&self, flow: &Arc<Flow>, reason: &str) {
        self.abort_flow(flow, false, reason);
    }

    fn abort_flow(&self, flow: &Arc<Flow>, reset: bool, reason: &str) {
        if flow.status() == FlowStatus::Aborted {
            return;
        }
        debug!("[{}] {} aborting: {}", flow.id(), flow.key(), reason);

        if reset {
            if let Some(tcp) = flow.tcp() {
                self.send(tcp.build_rst());
                self.stats.record_reset();
            }
        }

        {
            let mut selector = self.selector.lock();
            let _ = flow.transition(FlowStatus::Aborted);
            selector.close(flow);
        }
        self.registry.remove(flow);
        self.cache.stage(flow);
        self.stats.record_abort();
    }

    /// Orderly end of a flow: `CLOSED`, channel gone, out of the registry.
    pub fn close(&self, flow: &Arc<Flow>) -> Result<()> {
        {
            let mut selector = self.selector.lock();
            flow.transition(FlowStatus::Closed)?;
            selector.close(flow);
        }
        self.registry.remove(flow);
        self.cache.stage(flow);
        Ok(())
    }

    /// Remove a datagram flow whose channel failed or ended.
    pub fn discard(&self, flow: &Arc<Flow>) {
        {
            let mut selector = self.selector.lock();
            if !flow.status().is_terminal() {
                let _ = flow.transition(FlowStatus::Closed);
            }
            selector.close(flow);
        }
        self.registry.remove(flow);
        self.cache.stage(flow);
    }
}
