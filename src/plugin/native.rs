//! Compiled-in plugins
//!
//! Native plugins are registered with a [`NativeCatalog`] when the host is
//! built. A `.toml` manifest in the discovery directory selects one of them:
//!
//! ```toml
//! # title: Echo
//! factory = "echo"
//! id = "echo"          # optional, defaults to the file stem
//! name = "Echo Pipe"   # optional
//! ```

use figment::providers::{Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::LoadError;
use crate::plugin::builtin;
use crate::plugin::pipeline::Pipeline;
use crate::plugin::schema::PluginError;

pub type PipelineFactory =
    Arc<dyn Fn() -> Result<Box<dyn Pipeline>, PluginError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NativeManifest {
    pub factory: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl NativeManifest {
    pub fn parse(source: &str) -> Result<Self, LoadError> {
        Figment::from(Toml::string(source))
            .extract()
            .map_err(|e| LoadError::Import {
                reason: e.to_string(),
            })
    }
}

/// Registry of plugin factories available to `.toml` manifests
#[derive(Clone, Default)]
pub struct NativeCatalog {
    factories: BTreeMap<String, PipelineFactory>,
}

impl NativeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the plugins shipped in [`builtin`]
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        builtin::register(&mut catalog);
        catalog
    }

    pub fn register<F, P>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<P, PluginError> + Send + Sync + 'static,
        P: Pipeline + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move || factory().map(|pipeline| Box::new(pipeline) as Box<dyn Pipeline>)),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn instantiate(&self, manifest: &NativeManifest) -> Result<Box<dyn Pipeline>, LoadError> {
        let factory =
            self.factories
                .get(&manifest.factory)
                .ok_or_else(|| LoadError::CapabilityMissing {
                    reason: format!("no native plugin named '{}'", manifest.factory),
                })?;
        factory().map_err(|e| LoadError::Instantiation {
            reason: e.to_string(),
        })
    }
}
