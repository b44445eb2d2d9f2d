//! A loaded plugin and its bookkeeping

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::plugin::frontmatter::SourceMetadata;
use crate::plugin::pipeline::Pipeline;
use crate::plugin::schema::{Capabilities, PipelineKind, PluginError, SubModel};
use crate::plugin::valves::ValvesHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Active,
    Quarantined,
}

/// A source file that failed to load and was moved out of the discovery
/// directory
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineRecord {
    pub file: String,
    pub reason: String,
    pub state: ModuleState,
    pub at: DateTime<Utc>,
}

impl QuarantineRecord {
    pub fn new(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            reason: reason.into(),
            state: ModuleState::Quarantined,
            at: Utc::now(),
        }
    }
}

pub struct PluginModule {
    pub id: String,
    /// Display name declared by the plugin, if any
    pub name: Option<String>,
    pub path: PathBuf,
    pub metadata: SourceMetadata,
    pub kind: PipelineKind,
    pub capabilities: Capabilities,
    pub valves: ValvesHandle,
    pipeline: Arc<dyn Pipeline>,
}

impl PluginModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: Option<String>,
        path: PathBuf,
        metadata: SourceMetadata,
        kind: PipelineKind,
        capabilities: Capabilities,
        valves: ValvesHandle,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        Self {
            id,
            name,
            path,
            metadata,
            kind,
            capabilities,
            valves,
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &Arc<dyn Pipeline> {
        &self.pipeline
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// File name of the source, e.g. `echo.toml`
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn submodels(&self) -> Result<Vec<SubModel>, PluginError> {
        self.pipeline.pipelines(&self.valves.current())
    }

    pub fn startup(&self) -> Result<(), PluginError> {
        if !self.capabilities.on_startup {
            return Ok(());
        }
        self.pipeline.on_startup(&self.valves.current())
    }

    /// Run the shutdown hook if the plugin has one; failures are logged only.
    pub fn shutdown(&self) {
        if !self.capabilities.on_shutdown {
            return;
        }
        if let Err(e) = self.pipeline.on_shutdown(&self.valves.current()) {
            tracing::warn!(module = %self.id, error = %e, "Plugin on_shutdown failed");
        }
    }
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
