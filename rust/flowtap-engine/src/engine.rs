//! Engine lifecycle
//!
//! Wires the tunnel reader, dispatcher, socket event loop and tunnel writer
//! together around one tunnel descriptor and owns the shutdown order.

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::event_loop::EventLoop;
use crate::hostname::HostnameCache;
use crate::logging::init_logging;
use crate::metadata::{AppLookup, MetadataCollector, OwnerResolver, ProcNetOwnerResolver};
use crate::protect::SocketProtector;
use crate::reader::{DispatcherMessage, TunnelReader};
use crate::registry::FlowRegistry;
use crate::selector::Selector;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{BatchWriter, FlowStore, MemoryFlowStore, WriteBehindCache};
use crate::tun::{Interrupter, TunDevice};
use crate::writer::{run_writer, TunnelSink};
use mio::Poll;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine builder for fluent configuration
pub struct EngineBuilder {
    config: EngineConfig,
    protector: SocketProtector,
    store: Option<Arc<dyn FlowStore>>,
    resolver: Option<Arc<dyn OwnerResolver>>,
    app_lookup: Option<AppLookup>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            protector: SocketProtector::none(),
            store: None,
            resolver: None,
            app_lookup: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(mut self, session_id: u64) -> Self {
        self.config.session_id = session_id;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Hook that exempts outbound sockets from the VPN route.
    pub fn protector(mut self, protector: SocketProtector) -> Self {
        self.protector = protector;
        self
    }

    /// Where flow records go; an in-memory store when unset.
    pub fn store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn owner_resolver(mut self, resolver: Arc<dyn OwnerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Package lookup for the default `/proc/net` resolver.
    pub fn app_lookup(mut self, lookup: AppLookup) -> Self {
        self.app_lookup = Some(lookup);
        self
    }

    /// Take ownership of the tunnel descriptor and start forwarding.
    pub fn start(self, tun: OwnedFd) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        init_logging(config.log_level)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("flowtap-worker")
            .enable_all()
            .build()?;

        let device = Arc::new(TunDevice::new(tun));
        let interrupter = Arc::new(Interrupter::new()?);
        let poll = Poll::new()?;
        let selector = Arc::new(Selector::new(&poll)?);
        let registry = Arc::new(FlowRegistry::new());
        let hostnames = Arc::new(HostnameCache::new(config.hostname_cache_capacity));
        let cache = Arc::new(WriteBehindCache::new());
        let stats = Arc::new(EngineStats::new());

        let store: Arc<dyn FlowStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryFlowStore::new()),
        };
        let resolver: Arc<dyn OwnerResolver> = match (self.resolver, self.app_lookup) {
            (Some(resolver), _) => resolver,
            (None, Some(lookup)) => Arc::new(ProcNetOwnerResolver::with_lookup(lookup)),
            (None, None) => Arc::new(ProcNetOwnerResolver::new()),
        };
        let metadata = Arc::new(MetadataCollector::new(resolver, hostnames.clone(), cache.clone()));

        let (sink, writer_rx) = TunnelSink::channel(config.writer_queue);
        let (dispatcher_tx, dispatcher_rx) = mpsc::channel(config.dispatcher_queue);

        let ctx = Arc::new(EngineContext {
            config: config.clone(),
            registry,
            selector,
            sink,
            hostnames,
            cache: cache.clone(),
            store: store.clone(),
            metadata,
            protector: self.protector,
            stats: stats.clone(),
            runtime: runtime.handle().clone(),
        });
        let running = Arc::new(AtomicBool::new(true));

        let writer = {
            let device = device.clone();
            let stats = stats.clone();
            spawn_named("flowtap-tun-writer", move || run_writer(device, writer_rx, stats))?
        };
        let event_loop = {
            let event_loop = EventLoop::new(poll, ctx.clone(), running.clone());
            spawn_named("flowtap-event-loop", move || event_loop.run())?
        };
        let dispatcher = {
            let dispatcher = Dispatcher::new(ctx.clone());
            spawn_named("flowtap-dispatcher", move || dispatcher.run(dispatcher_rx))?
        };
        let reader = {
            let reader = TunnelReader::new(
                device.clone(),
                interrupter.clone(),
                dispatcher_tx.clone(),
                stats.clone(),
                config.mtu,
            );
            spawn_named("flowtap-tun-reader", move || reader.run())?
        };

        let batch_writer = BatchWriter::spawn(runtime.handle(), cache, store, config.flush_interval());

        info!(
            "Engine started: session {}, mtu {}, tunnel fd {}",
            config.session_id,
            config.mtu,
            device.fd()
        );

        Ok(Engine {
            ctx,
            interrupter,
            dispatcher_tx,
            running,
            device: Some(device),
            threads: Some(Threads {
                reader,
                dispatcher,
                event_loop,
                writer,
            }),
            batch_writer: Some(batch_writer),
            runtime: Some(runtime),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_named<F, T>(name: &str, body: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| EngineError::Internal(format!("failed to spawn {}: {}", name, e)))
}

struct Threads {
    reader: JoinHandle<Result<()>>,
    dispatcher: JoinHandle<()>,
    event_loop: JoinHandle<Result<()>>,
    writer: JoinHandle<()>,
}

impl Threads {
    fn all_alive(&self) -> bool {
        !self.reader.is_finished()
            && !self.dispatcher.is_finished()
            && !self.event_loop.is_finished()
            && !self.writer.is_finished()
    }
}

/// A running forwarding engine.
///
/// Must be shut down (or dropped) from outside any async context: teardown
/// blocks on the pipeline threads and the engine's own runtime.
pub struct Engine {
    ctx: Arc<EngineContext>,
    interrupter: Arc<Interrupter>,
    dispatcher_tx: mpsc::Sender<DispatcherMessage>,
    running: Arc<AtomicBool>,
    device: Option<Arc<TunDevice>>,
    threads: Option<Threads>,
    batch_writer: Option<BatchWriter>,
    runtime: Option<Runtime>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Whether every pipeline thread is still alive.
    pub fn is_running(&self) -> bool {
        self.threads.as_ref().is_some_and(Threads::all_alive)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.ctx.registry
    }

    pub fn hostnames(&self) -> &Arc<HostnameCache> {
        &self.ctx.hostnames
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.ctx.store
    }

    /// Stop the pipeline, close every flow and flush their records.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(threads) = self.threads.take() else {
            return;
        };
        info!("Engine shutting down");

        self.interrupter.trigger();
        join("tunnel reader", threads.reader);

        if self.dispatcher_tx.blocking_send(DispatcherMessage::Shutdown).is_err() {
            debug!("Dispatcher already gone");
        }
        join("dispatcher", threads.dispatcher);

        self.running.store(false, Ordering::Release);
        self.ctx.selector.wake();
        join("event loop", threads.event_loop);

        if self.ctx.sink.shutdown().is_err() {
            debug!("Tunnel writer already gone");
        }
        join("tunnel writer", threads.writer);

        // Reader and writer are gone; this is the last handle on the tunnel
        self.device.take();

        let closed = self.ctx.registry.close_all_and_clear();
        {
            let mut selector = self.ctx.selector.lock();
            for flow in &closed {
                selector.close(flow);
            }
        }
        for flow in &closed {
            self.ctx.cache.stage(flow);
        }

        if let Some(runtime) = self.runtime.take() {
            if let Some(batch_writer) = self.batch_writer.take() {
                if let Err(e) = runtime.block_on(batch_writer.stop()) {
                    warn!("Batch writer ended abnormally: {}", e);
                }
            }
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }

        let snapshot = self.ctx.stats.snapshot();
        info!(
            "Engine stopped: {} packets read, {} written, {} flows",
            snapshot.packets_read,
            snapshot.packets_written,
            snapshot.total_flows()
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a pipeline thread, logging how it ended.
fn join<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => {
            debug!("{} joined", name);
            Some(value)
        }
        Err(_) => {
            warn!("{} panicked", name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tests::{client_addr, udp_packet};
    use crate::flow::{Flow, FlowStatus};
    use crate::metadata::AppIdentity;
    use crate::packet::parse_packet;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
    use std::os::unix::net::UnixDatagram;

    struct StaticResolver;

    impl OwnerResolver for StaticResolver {
        fn resolve(&self, _flow: &Flow) -> Option<AppIdentity> {
            Some(AppIdentity {
                package: "org.example.browser".to_string(),
                label: Some("Browser".to_string()),
                uid: Some(10042),
            })
        }
    }

    /// Tunnel descriptor for the engine and the client end of it.
    fn tunnel() -> (OwnedFd, UnixDatagram) {
        let (engine, client) = UnixDatagram::pair().unwrap();
        (OwnedFd::from(engine), client)
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            session_id: 7,
            flush_interval_ms: 50,
            log_level: crate::config::LogLevel::Silent,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let (tun, _client) = tunnel();
        let config = EngineConfig {
            mtu: 10,
            ..quiet_config()
        };
        let result = Engine::builder().config(config).start(tun);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_udp_round_trip_and_shutdown() {
        let (tun, client) = tunnel();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let store = Arc::new(MemoryFlowStore::new());

        let engine = Engine::builder()
            .config(quiet_config())
            .store(store.clone())
            .owner_resolver(Arc::new(StaticResolver))
            .start(tun)
            .unwrap();
        assert!(engine.is_running());

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port());

        client
            .send(udp_packet(client_addr(), remote, b"ping").as_bytes())
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).unwrap();

        let mut reply = [0u8; 1500];
        let n = client.recv(&mut reply).unwrap();
        let packet = parse_packet(Bytes::copy_from_slice(&reply[..n])).unwrap();
        assert_eq!(packet.payload(), b"pong");
        assert_eq!(packet.src_socket(), remote);
        assert_eq!(packet.dst_socket(), client_addr());

        assert_eq!(engine.registry().len(), 1);
        let snapshot = engine.stats();
        assert_eq!(snapshot.udp_flows, 1);
        assert_eq!(snapshot.packets_read, 1);

        engine.shutdown();

        let records = store.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.session_id, 7);
        assert_eq!(record.protocol, "UDP");
        assert_eq!(record.port, remote.port());
        assert!(!record.is_active);
        assert!(record.duration >= 0);
        assert_eq!(record.packets_out, 1);
        assert_eq!(record.packets_in, 1);
    }

    #[test]
    fn test_drop_tears_down_pipeline() {
        let (tun, client) = tunnel();
        let store = Arc::new(MemoryFlowStore::new());
        let engine = Engine::builder()
            .config(quiet_config())
            .store(store.clone())
            .owner_resolver(Arc::new(StaticResolver))
            .start(tun)
            .unwrap();
        let registry = engine.registry().clone();
        drop(engine);

        assert!(registry.is_empty());
        // The tunnel end is closed once the engine is gone
        assert!(client.send(b"x").is_err());
    }

    #[test]
    fn test_shutdown_closes_open_flows() {
        let (tun, client) = tunnel();
        let store = Arc::new(MemoryFlowStore::new());
        let engine = Engine::builder()
            .config(quiet_config())
            .store(store.clone())
            .owner_resolver(Arc::new(StaticResolver))
            .start(tun)
            .unwrap();

        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port());
        client
            .send(udp_packet(client_addr(), remote, b"hello").as_bytes())
            .unwrap();
        let mut buf = [0u8; 16];
        server.recv_from(&mut buf).unwrap();

        let flow = engine.registry().flows().pop().unwrap();
        assert_eq!(flow.status(), FlowStatus::Connected);

        engine.shutdown();
        assert_eq!(flow.status(), FlowStatus::Closed);
        assert!(!flow.has_channel());
        assert!(store.records().iter().all(|r| !r.is_active));
    }
}
