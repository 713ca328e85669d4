//! flowtap engine - user-space packet forwarding for Android VPN tunnels
//!
//! The engine takes over the descriptor of a TUN interface, terminates every
//! IPv4 TCP and UDP flow the device sends into it, and carries each flow's
//! payload over a real socket that is exempted from the VPN route. Replies
//! are wrapped in synthesised IPv4 packets and written back to the tunnel.
//! Along the way each flow is attributed to the app that owns it and the
//! hostname it was resolved from, and its byte counters are persisted.
//!
//! # Features
//!
//! - Minimal TCP endpoint: handshake, in-order relay, half-close, resets
//! - UDP relay with channel reuse per 4-tuple
//! - Hostname learning from DNS responses passing through the tunnel
//! - Owner resolution through `/proc/net` and a host supplied package lookup
//! - Write-behind flow records with periodic batch flushes
//!
//! # Architecture
//!
//! ```text
//!            +-------------------------------------------+
//!            |                TUN device                 |
//!            +-------------------------------------------+
//!                 | read                        ^ write
//!                 v                             |
//!          +-------------+               +-------------+
//!          | tun reader  |               | tun writer  |
//!          +-------------+               +-------------+
//!                 | ParsedPacket                ^ Bytes
//!                 v                             |
//!          +-------------+  register    +---------------+
//!          | dispatcher  |------------->|  event loop   |
//!          +-------------+   selector   |  (mio::Poll)  |
//!                 |                     +---------------+
//!                 |    flow registry / hostnames  |
//!                 +--------------+----------------+
//!                                |
//!                   metadata + batch writer (tokio)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use flowtap_engine::{Engine, SocketProtector};
//!
//! let engine = Engine::builder()
//!     .session_id(42)
//!     .protector(SocketProtector::new(|fd| vpn_service.protect(fd)))
//!     .start(tun_fd)?;
//!
//! // ...
//! println!("{:?}", engine.stats());
//! engine.shutdown();
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod dns;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod flow;
pub mod hostname;
pub mod logging;
pub mod metadata;
pub mod packet;
pub mod protect;
pub mod reader;
pub mod registry;
pub mod selector;
pub mod stats;
pub mod store;
pub mod tun;
pub mod writer;

// Re-exports for convenience
pub use config::{EngineConfig, LogLevel};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use flow::{Attribution, Flow, FlowKey, FlowStatus, Protocol};
pub use hostname::{pay_level_domain, HostnameCache};
pub use logging::{clear_logs, get_recent_logs, init_logging};
pub use metadata::{AppIdentity, AppLookup, OwnerResolver, ProcNetOwnerResolver};
pub use packet::{parse_packet, ParsedPacket, TcpFlags};
pub use protect::{ProtectCallback, SocketProtector};
pub use registry::FlowRegistry;
pub use stats::{EngineStats, StatsSnapshot};
pub use store::{FlowRecord, FlowStore, MemoryFlowStore};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{EngineError, Result};
    pub use crate::protect::SocketProtector;
    pub use crate::store::FlowStore;
}
