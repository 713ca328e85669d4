//! Engine configuration

use crate::channel::SocketOptions;
use crate::error::{EngineError, Result};
use crate::packet::DEFAULT_MTU;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Trace,
    Silent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Session the flows of this engine are recorded under
    pub session_id: u64,
    /// Tunnel MTU, also the size of each flow's write buffer
    pub mtu: usize,
    /// SO_RCVBUF of real TCP sockets
    pub tcp_receive_buffer: usize,
    pub tcp_keepalive: bool,
    pub tcp_nodelay: bool,
    /// Tunnel reader to dispatcher queue depth
    pub dispatcher_queue: usize,
    /// Queue depth in front of the tunnel writer
    pub writer_queue: usize,
    /// Write-behind flush period for flow records
    pub flush_interval_ms: u64,
    pub hostname_cache_capacity: usize,
    /// Workers of the runtime running owner resolution and flushes
    pub worker_threads: usize,
    /// Consecutive `WouldBlock`s before a segment is only partly acknowledged
    pub write_retry_limit: usize,
    /// Datagram flows with no traffic for this long are dropped
    pub udp_idle_timeout_ms: u64,
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_id: 0,
            mtu: DEFAULT_MTU,
            tcp_receive_buffer: 65535,
            tcp_keepalive: true,
            tcp_nodelay: true,
            dispatcher_queue: 1024,
            writer_queue: 4096,
            flush_interval_ms: 1000,
            hostname_cache_capacity: 128,
            worker_threads: 2,
            write_retry_limit: 4096,
            udp_idle_timeout_ms: 60_000,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| EngineError::Config(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(576..=65535).contains(&self.mtu) {
            return Err(EngineError::Config(format!("mtu {} out of range 576..=65535", self.mtu)));
        }
        if self.dispatcher_queue == 0 || self.writer_queue == 0 {
            return Err(EngineError::Config("queue sizes must be non-zero".into()));
        }
        if self.hostname_cache_capacity == 0 {
            return Err(EngineError::Config("hostname_cache_capacity must be non-zero".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(EngineError::Config("flush_interval_ms must be non-zero".into()));
        }
        if self.worker_threads == 0 {
            return Err(EngineError::Config("worker_threads must be non-zero".into()));
        }
        if self.udp_idle_timeout_ms == 0 {
            return Err(EngineError::Config("udp_idle_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_idle_timeout_ms)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keepalive: self.tcp_keepalive,
            nodelay: self.tcp_nodelay,
            recv_buffer: self.tcp_receive_buffer,
        }
    }
}
