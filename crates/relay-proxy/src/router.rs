//! Dynamic route table
//!
//! Sources are reloaded from the store on a fixed interval. Each reload
//! builds a complete new `RouteTable` and swaps it in; readers clone the
//! current `Arc` and never see a partially built table or wait on a reload.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use relay_common::Source;
use relay_plugins::{PluginChain, PluginRegistry};
use relay_store::{Store, StoreError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// A routable source with its plugin chain ready to run
pub struct Route {
    pub source: Source,
    pub plugins: PluginChain,
}

impl Route {
    fn matches(&self, method: &str, path: &str) -> bool {
        self.source.path == path && self.source.accepts_method(method)
    }
}

/// Immutable, ordered set of routes
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Build a table from sources in order. Disabled sources are skipped,
    /// and so are sources whose plugins cannot be built: such a source
    /// answers 404 until its configuration is fixed.
    pub fn build(sources: Vec<Source>, registry: &PluginRegistry) -> Self {
        let mut routes = Vec::with_capacity(sources.len());
        for source in sources.into_iter().filter(|s| s.enabled) {
            match PluginChain::build(registry, &source.plugins) {
                Ok(plugins) => routes.push(Arc::new(Route { source, plugins })),
                Err(e) => {
                    error!(source_id = %source.id, path = %source.path, error = %e, "Source excluded from routing");
                }
            }
        }
        Self { routes }
    }

    /// First route whose path equals `path` and whose methods include `method`
    pub fn lookup(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.matches(method, path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub struct Router {
    store: Arc<dyn Store>,
    registry: PluginRegistry,
    table: RwLock<Arc<RouteTable>>,
    span: Span,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, registry: PluginRegistry) -> Self {
        Self {
            store,
            registry,
            table: RwLock::new(Arc::new(RouteTable::default())),
            span: info_span!("router"),
        }
    }

    /// Rebuild the table from the store. On failure the current table stays.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let sources = self.store.list_sources().await?;
        let table = Arc::new(RouteTable::build(sources, &self.registry));
        let routes = table.len();
        *self.table.write() = table;
        Ok(routes)
    }

    pub fn route(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        self.table().lookup(method, path)
    }

    /// Current table snapshot
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.read().clone()
    }

    /// Reload every `interval` until shutdown
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                info!(interval_ms = interval.as_millis() as u64, "Route refresh started");

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match self.reload().await {
                                Ok(routes) => debug!(routes, "Routes reloaded"),
                                Err(e) => warn!(error = %e, "Failed to reload routes, keeping previous table"),
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Route refresh shutting down");
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        )
    }
}
