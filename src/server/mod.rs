//! Server framework
//!
//! A process-global registry maps protocol names to server factories; the
//! main routine looks settings up by name and instantiates one server per
//! configured section. Registration is explicit, idempotent, and
//! order-independent: `register_all` is called exactly once at startup.

pub mod http;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::query::QueryProcessor;
use crate::signal::SignalHandler;
use crate::storage::Connection;
use crate::types::ServerSettings;

pub use http::HttpServer;
pub use tcp::TcpServer;
pub use udp::UdpServer;

/// A network-facing server instance.
#[async_trait]
pub trait Server: Send + Sync {
    /// Register `stop` with the signal handler under `id`, bring up all
    /// listeners/workers, and return once they are ready to serve.
    async fn start(&self, sig: &mut SignalHandler, id: u32) -> Result<()>;

    /// Idempotent; safe to invoke from another thread.
    fn stop(&self);

    /// Display name for lifecycle messages.
    fn name(&self) -> &'static str;
}

/// Factory signature stored in the registry.
pub type ServerFactory =
    fn(Arc<Connection>, Arc<QueryProcessor>, &ServerSettings) -> Result<Arc<dyn Server>>;

static REGISTRY: OnceLock<RwLock<HashMap<&'static str, ServerFactory>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<&'static str, ServerFactory>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a factory under a protocol name. Re-registration is a no-op.
pub fn register(name: &'static str, factory: ServerFactory) {
    registry().write().entry(name).or_insert(factory);
}

/// Register every built-in server type. Idempotent.
pub fn register_all() {
    register("HTTP", http::build);
    register("TCP", tcp::build);
    register("UDP", udp::build);
}

/// Instantiate the server described by `settings`.
pub fn create_server(
    con: Arc<Connection>,
    qproc: Arc<QueryProcessor>,
    settings: &ServerSettings,
) -> Result<Arc<dyn Server>> {
    let factory = {
        let registry = registry().read();
        match registry.get(settings.name.as_str()) {
            Some(&factory) => factory,
            None => bail!("unknown protocol: `{}`", settings.name),
        }
    };
    factory(con, qproc, settings)
}

/// Ingestion throughput counters shared by a server's workers.
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    pps: AtomicU64,
    bps: AtomicU64,
}

impl IngestionMetrics {
    pub fn record(&self, packets: u64, bytes: u64) {
        self.pps.fetch_add(packets, Ordering::Relaxed);
        self.bps.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Packets processed so far.
    pub fn packets(&self) -> u64 {
        self.pps.load(Ordering::Relaxed)
    }

    /// Bytes processed so far.
    pub fn bytes(&self) -> u64 {
        self.bps.load(Ordering::Relaxed)
    }
}
