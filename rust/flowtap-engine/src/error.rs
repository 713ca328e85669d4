//! Error types for the flowtap engine

use crate::flow::FlowStatus;
use std::io;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the forwarding engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: FlowStatus, to: FlowStatus },

    #[error("Flow has no channel attached")]
    NoChannel,

    #[error("Channel type does not match flow protocol")]
    ChannelMismatch,

    #[error("Payload of {len} bytes exceeds buffer capacity {capacity}")]
    BufferOverflow { len: usize, capacity: usize },

    #[error("Socket protection refused for fd {0}")]
    ProtectFailed(i32),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("Flow store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Multiplexer error: {0}")]
    Multiplexer(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error only concerns a single flow and the pipeline can
    /// keep running.
    pub fn is_flow_local(&self) -> bool {
        !matches!(
            self,
            EngineError::Multiplexer(_) | EngineError::ChannelClosed | EngineError::Config(_)
        )
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}
