//! Engine-wide statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pipeline counters, updated lock-free from every thread.
#[derive(Debug)]
pub struct EngineStats {
    start_time: Instant,

    // Tunnel
    pub packets_read: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub packets_dispatched: AtomicU64,
    pub packets_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub write_errors: AtomicU64,

    // Flows
    pub tcp_flows: AtomicU64,
    pub udp_flows: AtomicU64,
    pub udp_expired: AtomicU64,
    pub flows_aborted: AtomicU64,
    pub resets_sent: AtomicU64,
    pub stray_resets: AtomicU64,
    pub key_collisions: AtomicU64,

    // DNS
    pub dns_responses: AtomicU64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_read: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_invalid: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            packets_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            tcp_flows: AtomicU64::new(0),
            udp_flows: AtomicU64::new(0),
            udp_expired: AtomicU64::new(0),
            flows_aborted: AtomicU64::new(0),
            resets_sent: AtomicU64::new(0),
            stray_resets: AtomicU64::new(0),
            key_collisions: AtomicU64::new(0),
            dns_responses: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_read(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: usize) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_flow(&self) {
        self.tcp_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_flow(&self) {
        self.udp_flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_expired(&self) {
        self.udp_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.flows_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stray_reset(&self) {
        self.stray_resets.fetch_add(1, Ordering::Relaxed);
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collision(&self) {
        self.key_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_response(&self) {
        self.dns_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            tcp_flows: self.tcp_flows.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            udp_expired: self.udp_expired.load(Ordering::Relaxed),
            flows_aborted: self.flows_aborted.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            stray_resets: self.stray_resets.load(Ordering::Relaxed),
            key_collisions: self.key_collisions.load(Ordering::Relaxed),
            dns_responses: self.dns_responses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_read: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub packets_dispatched: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub tcp_flows: u64,
    pub udp_flows: u64,
    pub udp_expired: u64,
    pub flows_aborted: u64,
    pub resets_sent: u64,
    pub stray_resets: u64,
    pub key_collisions: u64,
    pub dns_responses: u64,
}

impl StatsSnapshot {
    pub fn total_flows(&self) -> u64 {
        self.tcp_flows + self.udp_flows
    }
}
