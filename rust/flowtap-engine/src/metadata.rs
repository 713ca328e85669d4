//! Best-effort attribution of flows to apps and hostnames

use crate::flow::{Attribution, Flow};
use crate::hostname::{pay_level_domain, HostnameCache};
use crate::store::WriteBehindCache;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace};

pub const UNKNOWN_APP: &str = "unknown";

/// Maps an owning uid to the app's package name and display label.
pub type AppLookup = Arc<dyn Fn(u32) -> Option<(String, Option<String>)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub package: String,
    pub label: Option<String>,
    pub uid: Option<u32>,
}

impl AppIdentity {
    pub fn unknown() -> Self {
        Self {
            package: UNKNOWN_APP.to_string(),
            label: None,
            uid: None,
        }
    }
}

/// Looks up which app owns the client side of a flow.
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, flow: &Flow) -> Option<AppIdentity>;
}

/// Resolves owners through the kernel's `/proc/net` socket tables.
#[derive(Clone, Default)]
pub struct ProcNetOwnerResolver {
    lookup: Option<AppLookup>,
}

impl ProcNetOwnerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lookup(lookup: AppLookup) -> Self {
        Self { lookup: Some(lookup) }
    }
}

impl fmt::Debug for ProcNetOwnerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcNetOwnerResolver")
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

impl OwnerResolver for ProcNetOwnerResolver {
    fn resolve(&self, flow: &Flow) -> Option<AppIdentity> {
        let uid = match flowtap_sock2proc::find_uid(flow.protocol().into(), flow.local().port()) {
            Ok(uid) => uid,
            Err(e) => {
                debug!("[{}] owner lookup failed: {}", flow.id(), e);
                return None;
            }
        };

        let (package, label) = self
            .lookup
            .as_ref()
            .and_then(|lookup| lookup(uid))
            .unwrap_or_else(|| (format!("uid:{}", uid), None));

        Some(AppIdentity {
            package,
            label,
            uid: Some(uid),
        })
    }
}

/// Fills in a flow's attribution and stages it for persistence.
///
/// Runs on the engine runtime's blocking pool, off the forwarding threads.
pub struct MetadataCollector {
    resolver: Arc<dyn OwnerResolver>,
    hostnames: Arc<HostnameCache>,
    cache: Arc<WriteBehindCache>,
}

impl MetadataCollector {
    pub fn new(
        resolver: Arc<dyn OwnerResolver>,
        hostnames: Arc<HostnameCache>,
        cache: Arc<WriteBehindCache>,
    ) -> Self {
        Self {
            resolver,
            hostnames,
            cache,
        }
    }

    pub fn collect(&self, flow: &Arc<Flow>) {
        let app = self.resolver.resolve(flow).unwrap_or_else(AppIdentity::unknown);

        let remote = IpAddr::V4(*flow.remote().ip());
        let hostname = self
            .hostnames
            .find(&remote)
            .unwrap_or_else(|| remote.to_string());
        let pld = pay_level_domain(&hostname);

        trace!(
            "[{}] {} attributed to {} ({})",
            flow.id(),
            flow.key(),
            app.package,
            hostname
        );

        flow.set_attribution(Attribution {
            app_package: Some(app.package),
            app_label: app.label,
            uid: app.uid,
            hostname: Some(hostname),
            pay_level_domain: Some(pld),
        });
        self.cache.stage(flow);
    }

    /// Hand `flow` to the blocking pool of `runtime`.
    pub fn spawn(self: &Arc<Self>, runtime: &tokio::runtime::Handle, flow: Arc<Flow>) {
        let collector = self.clone();
        runtime.spawn_blocking(move || collector.collect(&flow));
    }
}
