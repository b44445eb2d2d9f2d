//! Flat model catalog derived from the loaded plugin modules
//!
//! The catalog is a pure function of the module table. It is cached as an
//! immutable snapshot tagged with the table's version; every mutation bumps
//! the version and the next read rebuilds the snapshot.

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::LoadError;
use crate::plugin::module::PluginModule;
use crate::plugin::schema::PipelineKind;
use crate::plugin::valves::ValvesHandle;

/// Match list and priority of a filter, read from its valves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSpec {
    pub pipelines: Vec<String>,
    /// Lower runs first
    pub priority: i64,
}

impl FilterSpec {
    pub fn matches(&self, model_id: &str) -> bool {
        self.pipelines
            .iter()
            .any(|pipeline| pipeline == "*" || pipeline == model_id)
    }
}

/// One entry of the catalog
#[derive(Clone)]
pub struct PipelineDescriptor {
    pub id: String,
    pub name: String,
    pub kind: PipelineKind,
    pub module: Arc<PluginModule>,
    /// Set for manifold submodels
    pub submodel_id: Option<String>,
    /// Set for filters
    pub filter: Option<FilterSpec>,
}

impl PipelineDescriptor {
    pub fn module_id(&self) -> &str {
        &self.module.id
    }

    pub fn valves(&self) -> &ValvesHandle {
        &self.module.valves
    }

    /// Whether the descriptor can serve chat completions
    pub fn is_completion(&self) -> bool {
        self.kind != PipelineKind::Filter
    }

    /// The `model` value the plugin's entry point receives
    pub fn model_id(&self) -> &str {
        self.submodel_id.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Debug for PipelineDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("module", &self.module.id)
            .field("submodel_id", &self.submodel_id)
            .field("filter", &self.filter)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub version: u64,
    entries: BTreeMap<String, PipelineDescriptor>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&PipelineDescriptor> {
        self.entries.get(id)
    }

    /// Descriptors in id order
    pub fn iter(&self) -> impl Iterator<Item = &PipelineDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derive the catalog from a set of modules
pub fn derive<'a>(
    modules: impl IntoIterator<Item = &'a Arc<PluginModule>>,
) -> BTreeMap<String, PipelineDescriptor> {
    let mut entries = BTreeMap::new();

    for module in modules {
        match module.kind {
            PipelineKind::Manifold => {
                let submodels = module.submodels().unwrap_or_else(|e| {
                    warn!(module = %module.id, error = %e, "Failed to list manifold submodels");
                    Vec::new()
                });
                for submodel in submodels {
                    let id = format!("{}.{}", module.id, submodel.id);
                    let name = match &module.name {
                        Some(prefix) => format!("{prefix}{}", submodel.name),
                        None => submodel.name,
                    };
                    entries.insert(
                        id.clone(),
                        PipelineDescriptor {
                            id,
                            name,
                            kind: PipelineKind::Manifold,
                            module: module.clone(),
                            submodel_id: Some(submodel.id),
                            filter: None,
                        },
                    );
                }
            }
            PipelineKind::Filter => {
                let valves = module.valves.current();
                let filter = FilterSpec {
                    pipelines: valves.get_str_list("pipelines").unwrap_or_default(),
                    priority: valves.get_i64("priority").unwrap_or(0),
                };
                entries.insert(
                    module.id.clone(),
                    PipelineDescriptor {
                        id: module.id.clone(),
                        name: module.display_name().to_string(),
                        kind: PipelineKind::Filter,
                        module: module.clone(),
                        submodel_id: None,
                        filter: Some(filter),
                    },
                );
            }
            PipelineKind::Pipe => {
                entries.insert(
                    module.id.clone(),
                    PipelineDescriptor {
                        id: module.id.clone(),
                        name: module.display_name().to_string(),
                        kind: PipelineKind::Pipe,
                        module: module.clone(),
                        submodel_id: None,
                        filter: None,
                    },
                );
            }
        }
    }

    entries
}

/// The process-wide module table and its cached catalog
pub struct Registry {
    modules: DashMap<String, Arc<PluginModule>>,
    version: AtomicU64,
    cache: ArcSwap<RegistrySnapshot>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
            version: AtomicU64::new(0),
            cache: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    pub fn insert(&self, module: Arc<PluginModule>) -> Result<(), LoadError> {
        match self.modules.entry(module.id.clone()) {
            Entry::Occupied(entry) => {
                return Err(LoadError::DuplicateId {
                    id: entry.key().clone(),
                })
            }
            Entry::Vacant(entry) => {
                entry.insert(module);
            }
        }
        self.bump();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PluginModule>> {
        let removed = self.modules.remove(id).map(|(_, module)| module);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Empty the module table, returning what was in it
    pub fn drain(&self) -> Vec<Arc<PluginModule>> {
        let modules = self.modules();
        self.modules.clear();
        self.bump();
        modules
    }

    pub fn module(&self, id: &str) -> Option<Arc<PluginModule>> {
        self.modules.get(id).map(|entry| entry.value().clone())
    }

    /// All modules in id order
    pub fn modules(&self) -> Vec<Arc<PluginModule>> {
        let mut modules: Vec<_> = self
            .modules
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Invalidate the cached catalog
    pub fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let version = self.version();
        let cached = self.cache.load_full();
        if cached.version == version {
            return cached;
        }

        let modules = self.modules();
        let snapshot = Arc::new(RegistrySnapshot {
            version,
            entries: derive(&modules),
        });
        debug!(
            version,
            modules = modules.len(),
            entries = snapshot.len(),
            "Rebuilt pipeline registry"
        );
        self.cache.store(snapshot.clone());
        snapshot
    }

    pub fn resolve(&self, id: &str) -> Option<PipelineDescriptor> {
        self.snapshot().get(id).cloned()
    }

    /// Module owning `id`, which may be a module id or a submodel id
    pub fn owning_module(&self, id: &str) -> Option<Arc<PluginModule>> {
        if let Some(descriptor) = self.snapshot().get(id) {
            return Some(descriptor.module.clone());
        }
        if let Some(module) = self.module(id) {
            return Some(module);
        }
        id.split_once('.')
            .and_then(|(module_id, _)| self.module(module_id))
    }

    /// Completion-capable descriptors in id order
    pub fn models(&self) -> Vec<PipelineDescriptor> {
        self.snapshot()
            .iter()
            .filter(|descriptor| descriptor.is_completion())
            .cloned()
            .collect()
    }

    pub fn filters(&self) -> Vec<PipelineDescriptor> {
        self.snapshot()
            .iter()
            .filter(|descriptor| descriptor.kind == PipelineKind::Filter)
            .cloned()
            .collect()
    }

    /// Filters whose match list names `model_id` or `"*"`. The result is not
    /// ordered by priority.
    pub fn filters_matching(&self, model_id: &str) -> Vec<PipelineDescriptor> {
        self.snapshot()
            .iter()
            .filter(|descriptor| {
                descriptor
                    .filter
                    .as_ref()
                    .is_some_and(|filter| filter.matches(model_id))
            })
            .cloned()
            .collect()
    }
}
