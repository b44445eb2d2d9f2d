//! Plugin lifecycle management
//!
//! Every mutation of the module table (scan, reload, add, upload, delete,
//! valves update) goes through the manager and is serialized by one lock, so
//! two reloads never interleave. Callers only see success once the full
//! effect, including shutdown and startup hooks, has happened.

use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::PluginsConfig;
use crate::error::{GatewayError, Result};
use crate::plugin::loader::{LoadReport, PluginLoader};
use crate::plugin::module::{PluginModule, QuarantineRecord};
use crate::plugin::native::NativeCatalog;
use crate::plugin::valves::Valves;
use crate::registry::Registry;
use crate::state::Metrics;

pub struct PluginManager {
    loader: PluginLoader,
    registry: Arc<Registry>,
    /// Files quarantined by this process, keyed by their name in `failed/`
    quarantined: DashMap<String, QuarantineRecord>,
    lifecycle: Mutex<()>,
    metrics: Arc<Metrics>,
    http: reqwest::Client,
}

impl PluginManager {
    pub fn new(
        config: PluginsConfig,
        catalog: NativeCatalog,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            loader: PluginLoader::new(config, catalog),
            registry,
            quarantined: DashMap::new(),
            lifecycle: Mutex::new(()),
            metrics,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.loader.config().dir
    }

    /// Initial scan of the discovery directory
    pub async fn discover_plugins(&self) -> Result<LoadReport> {
        let _lifecycle = self.lifecycle.lock().await;
        self.scan_locked().await
    }

    /// Shut every module down and rescan from scratch
    pub async fn reload(&self) -> Result<LoadReport> {
        let _lifecycle = self.lifecycle.lock().await;
        self.reload_locked().await
    }

    /// Run every module's shutdown hook and empty the registry
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    async fn reload_locked(&self) -> Result<LoadReport> {
        info!("Reloading plugins");
        self.teardown().await;
        self.scan_locked().await
    }

    async fn teardown(&self) {
        for module in self.registry.drain() {
            shutdown_module(module).await;
        }
        self.metrics.set_loaded_modules(0);
    }

    async fn scan_locked(&self) -> Result<LoadReport> {
        let report = self.loader.scan(&self.registry).await?;
        for record in &report.quarantined {
            self.metrics.record_quarantine();
            self.quarantined.insert(record.file.clone(), record.clone());
        }
        self.metrics.record_reload();
        self.metrics.set_loaded_modules(self.registry.len());
        Ok(report)
    }

    /// Delete a module's source file, shut the module down and reload. A file
    /// that cannot be removed leaves the module loaded.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let path = self
            .registry
            .module(id)
            .map(|module| module.path.clone())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;

        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(module = %id, file = %path.display(), error = %e, "Failed to remove plugin file");
                return Err(e.into());
            }
        }
        info!(module = %id, file = %path.display(), "Deleted plugin");

        if let Some(module) = self.registry.remove(id) {
            shutdown_module(module).await;
        }
        self.reload_locked().await.map(|_| ())
    }

    /// Download a plugin file and reload. Returns the saved file name.
    pub async fn install_from_url(&self, url: &str) -> Result<String> {
        let url = raw_github_url(url)?;
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string)
            .unwrap_or_default();
        let file_name = self.checked_file_name(&file_name)?;

        info!(url = %url, file = %file_name, "Downloading plugin");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| GatewayError::Download(e.to_string()))?;
        let content = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Download(e.to_string()))?;

        self.save_and_reload(&file_name, &content).await?;
        Ok(file_name)
    }

    /// Save an uploaded plugin file and reload. Returns the saved file name.
    pub async fn install_file(&self, file_name: &str, content: &[u8]) -> Result<String> {
        let file_name = self.checked_file_name(file_name)?;
        self.save_and_reload(&file_name, content).await?;
        Ok(file_name)
    }

    async fn save_and_reload(&self, file_name: &str, content: &[u8]) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        std::fs::create_dir_all(self.plugin_dir())?;
        let target = self.plugin_dir().join(file_name);
        std::fs::write(&target, content)?;
        info!(file = %target.display(), bytes = content.len(), "Saved plugin file");
        self.reload_locked().await.map(|_| ())
    }

    /// Reduce a client supplied name to a bare file name a backend can load
    fn checked_file_name(&self, name: &str) -> Result<String> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty() && !name.starts_with('.'))
            .ok_or_else(|| GatewayError::InvalidRequest(format!("Invalid file name '{name}'")))?;

        if self.loader.backend_for(&PathBuf::from(file_name)).is_none() {
            return Err(GatewayError::InvalidRequest(format!(
                "No plugin backend handles '{file_name}'"
            )));
        }
        Ok(file_name.to_string())
    }

    fn module(&self, id: &str) -> Result<Arc<PluginModule>> {
        self.registry
            .owning_module(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn valves(&self, id: &str) -> Result<Arc<Valves>> {
        Ok(self.module(id)?.valves.current())
    }

    pub fn valves_spec(&self, id: &str) -> Result<Value> {
        Ok(self.module(id)?.valves.schema().to_json_schema())
    }

    /// Validate and persist new valves, then notify the plugin
    pub async fn update_valves(&self, id: &str, record: &Value) -> Result<Arc<Valves>> {
        let _lifecycle = self.lifecycle.lock().await;
        let module = self.module(id)?;
        let valves = module.valves.update(record)?;

        let task_module = module.clone();
        let task_valves = valves.clone();
        let hooked = tokio::task::spawn_blocking(move || {
            task_module.pipeline().on_valves_updated(&task_valves)
        })
        .await;

        // submodel lists and filter match lists derive from valves
        self.registry.bump();

        match hooked {
            Ok(Ok(())) => Ok(valves),
            Ok(Err(e)) => {
                error!(module = %module.id, error = %e, "Plugin on_valves_updated failed");
                Err(e.into())
            }
            Err(e) => Err(GatewayError::Plugin(
                crate::plugin::schema::PluginError::runtime(format!(
                    "on_valves_updated panicked: {e}"
                )),
            )),
        }
    }

    /// Files quarantined since startup, oldest first
    pub fn quarantined(&self) -> Vec<QuarantineRecord> {
        let mut records: Vec<_> = self
            .quarantined
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.at);
        records
    }
}

async fn shutdown_module(module: Arc<PluginModule>) {
    let id = module.id.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || module.shutdown()).await {
        warn!(module = %id, error = %e, "Plugin shutdown panicked");
    }
}

/// Point GitHub "blob" page URLs at the raw file
fn raw_github_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::InvalidRequest(format!(
            "Unsupported URL scheme '{}'",
            url.scheme()
        )));
    }

    if url.host_str() != Some("github.com") {
        return Ok(url);
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.collect())
        .unwrap_or_default();
    match segments.as_slice() {
        [owner, repo, "blob", rest @ ..] if !rest.is_empty() => {
            let rewritten = format!(
                "https://raw.githubusercontent.com/{owner}/{repo}/{}",
                rest.join("/")
            );
            url::Url::parse(&rewritten)
                .map_err(|e| GatewayError::InvalidRequest(format!("Invalid URL '{raw}': {e}")))
        }
        _ => Ok(url),
    }
}
