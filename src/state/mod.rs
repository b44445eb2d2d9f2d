use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::{Dispatcher, WorkerPool};
use crate::filter::FilterInvoker;
use crate::plugin::{NativeCatalog, PluginManager};
use crate::registry::Registry;

pub mod metrics;

pub use metrics::Metrics;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub manager: Arc<PluginManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub filters: Arc<FilterInvoker>,
    pub pool: Arc<WorkerPool>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<Self>, tokio::sync::broadcast::Receiver<()>) {
        Self::with_catalog(config, NativeCatalog::with_builtins())
    }

    /// State whose native plugins come from `catalog`
    pub fn with_catalog(
        config: Config,
        catalog: NativeCatalog,
    ) -> (Arc<Self>, tokio::sync::broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(16);

        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(Registry::new());
        let pool = Arc::new(WorkerPool::new(config.plugins.worker_pool_size));
        let call_timeout = config.plugins.call_timeout();

        let manager = Arc::new(PluginManager::new(
            config.plugins.clone(),
            catalog,
            registry.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            pool.clone(),
            metrics.clone(),
            call_timeout,
            config.plugins.stream_buffer,
        ));
        let filters = Arc::new(FilterInvoker::new(
            registry.clone(),
            pool.clone(),
            metrics.clone(),
            call_timeout,
        ));

        let state = Arc::new(Self {
            config,
            registry,
            manager,
            dispatcher,
            filters,
            pool,
            metrics,
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());

        self.manager.shutdown().await;
        self.pool.close();
    }
}
