//! Turns files in the discovery directory into plugin modules
//!
//! Files are scanned one at a time in name order. A file that fails any load
//! step is moved into the quarantine folder and never looked at again; the
//! scan carries on with the next file.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::PluginsConfig;
use crate::error::LoadError;
use crate::plugin::frontmatter::{self, SourceMetadata};
use crate::plugin::module::{PluginModule, QuarantineRecord};
use crate::plugin::native::{NativeCatalog, NativeManifest};
use crate::plugin::pipeline::Pipeline;
use crate::plugin::process::ProcessPipeline;
use crate::plugin::schema::PipelineKind;
use crate::plugin::valves::ValvesHandle;
use crate::registry::Registry;

/// How a file is brought to life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// `.toml` manifest naming a compiled-in factory
    Native,
    /// Child process started with this interpreter
    Process(PathBuf),
}

/// Outcome of one directory scan
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub quarantined: Vec<QuarantineRecord>,
    pub skipped: Vec<PathBuf>,
}

/// Dry-run result for one file
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<PipelineKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whether a load creates state on disk and installs requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live,
    DryRun,
}

pub struct PluginLoader {
    config: PluginsConfig,
    catalog: NativeCatalog,
}

impl PluginLoader {
    pub fn new(config: PluginsConfig, catalog: NativeCatalog) -> Self {
        Self { config, catalog }
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.config
    }

    pub fn catalog(&self) -> &NativeCatalog {
        &self.catalog
    }

    pub fn backend_for(&self, path: &Path) -> Option<Backend> {
        let extension = path.extension()?.to_str()?;
        if extension == "toml" {
            return Some(Backend::Native);
        }
        self.config
            .interpreters
            .get(extension)
            .map(|interpreter| Backend::Process(interpreter.clone()))
    }

    /// Plugin source files in the discovery directory, sorted by name
    pub fn candidates(&self) -> Result<Vec<PathBuf>, LoadError> {
        let dir = &self.config.dir;
        let entries = std::fs::read_dir(dir).map_err(|e| LoadError::Discovery {
            reason: format!("Failed to read plugin directory {}: {e}", dir.display()),
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Load every file in the discovery directory into `registry`
    pub async fn scan(&self, registry: &Registry) -> Result<LoadReport, LoadError> {
        let dir = &self.config.dir;
        std::fs::create_dir_all(dir).map_err(|e| LoadError::Discovery {
            reason: format!("Failed to create plugin directory {}: {e}", dir.display()),
        })?;

        let mut report = LoadReport::default();
        for path in self.candidates()? {
            if self.backend_for(&path).is_none() {
                debug!(file = %path.display(), "Skipping file without a plugin backend");
                report.skipped.push(path);
                continue;
            }

            let span = info_span!("plugin_load", file = %path.display());
            let loaded = async {
                let module = Arc::new(self.load_file(&path).await?);
                registry.insert(module.clone())?;
                Ok::<_, LoadError>(module)
            }
            .instrument(span)
            .await;

            match loaded {
                Ok(module) => {
                    run_startup(&module).await;
                    info!(
                        module = %module.id,
                        kind = %module.kind,
                        file = %path.display(),
                        "Loaded plugin"
                    );
                    report.loaded.push(module.id.clone());
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Failed to load plugin");
                    report.quarantined.push(self.quarantine(&path, &e.to_string()));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            quarantined = report.quarantined.len(),
            skipped = report.skipped.len(),
            "Plugin scan finished"
        );
        Ok(report)
    }

    /// Load a single file without registering it
    pub async fn load_file(&self, path: &Path) -> Result<PluginModule, LoadError> {
        self.load(path, Mode::Live).await
    }

    /// Try to load every file without touching the directory, the registry or
    /// the environment
    pub async fn inspect(&self) -> Result<Vec<Inspection>, LoadError> {
        let mut seen = HashSet::new();
        let mut inspections = Vec::new();

        for path in self.candidates()? {
            if self.backend_for(&path).is_none() {
                continue;
            }
            let file = file_name(&path);
            let inspection = match self.load(&path, Mode::DryRun).await {
                Ok(module) if !seen.insert(module.id.clone()) => Inspection {
                    file,
                    id: Some(module.id.clone()),
                    kind: Some(module.kind),
                    error: Some(LoadError::DuplicateId { id: module.id.clone() }.to_string()),
                },
                Ok(module) => Inspection {
                    file,
                    id: Some(module.id.clone()),
                    kind: Some(module.kind),
                    error: None,
                },
                Err(e) => Inspection {
                    file,
                    id: None,
                    kind: None,
                    error: Some(e.to_string()),
                },
            };
            inspections.push(inspection);
        }
        Ok(inspections)
    }

    async fn load(&self, path: &Path, mode: Mode) -> Result<PluginModule, LoadError> {
        let backend = self.backend_for(path).ok_or_else(|| LoadError::Import {
            reason: format!("no backend handles {}", path.display()),
        })?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| LoadError::InvalidId {
                id: path.display().to_string(),
            })?
            .to_string();

        self.check_state_folder(path, &stem)?;

        let source = std::fs::read_to_string(path).map_err(|e| LoadError::Import {
            reason: format!("Failed to read {}: {e}", path.display()),
        })?;

        let sidecar = match mode {
            Mode::Live => prepare_state_dir(&self.config.dir.join(&stem))?,
            Mode::DryRun => self.config.dir.join(&stem).join("valves.json"),
        };

        let metadata = frontmatter::parse(&source).unwrap_or_else(|e| {
            warn!(file = %path.display(), error = %e, "Ignoring malformed metadata block");
            SourceMetadata::default()
        });

        if !metadata.requirements.is_empty() {
            match mode {
                Mode::Live => self.install_requirements(&metadata.requirements).await?,
                Mode::DryRun => debug!(
                    requirements = ?metadata.requirements,
                    "Skipping requirements in dry run"
                ),
            }
        }

        let (pipeline, manifest_id, manifest_name): (Arc<dyn Pipeline>, _, _) = match backend {
            Backend::Native => {
                let manifest = NativeManifest::parse(&source)?;
                let pipeline = self.catalog.instantiate(&manifest)?;
                (Arc::from(pipeline), manifest.id, manifest.name)
            }
            Backend::Process(interpreter) => {
                let plugin_path = path.to_path_buf();
                let pool_size = self.config.pool_size_per_plugin;
                let pipeline = tokio::task::spawn_blocking(move || {
                    ProcessPipeline::launch(interpreter, plugin_path, pool_size)
                })
                .await
                .map_err(|e| LoadError::Instantiation {
                    reason: e.to_string(),
                })??;
                (Arc::new(pipeline) as Arc<dyn Pipeline>, None, None)
            }
        };

        let declared = pipeline.manifest();
        let capabilities = pipeline.capabilities();
        if !capabilities.is_loadable() {
            return Err(LoadError::CapabilityMissing {
                reason: "plugin has neither a pipe entry point nor an inlet/outlet hook"
                    .to_string(),
            });
        }
        if declared.kind != PipelineKind::Filter && !capabilities.pipe {
            return Err(LoadError::CapabilityMissing {
                reason: format!("{} plugin has no pipe entry point", declared.kind),
            });
        }

        let id = manifest_id.or(declared.id).unwrap_or(stem);
        if id.is_empty() || id.contains('.') {
            return Err(LoadError::InvalidId { id });
        }

        let valves = ValvesHandle::load(pipeline.valves_schema(), sidecar)?;

        Ok(PluginModule::new(
            id,
            manifest_name.or(declared.name),
            path.to_path_buf(),
            metadata,
            declared.kind,
            capabilities,
            valves,
            pipeline,
        ))
    }

    /// The state folder `<stem>/` belongs to the first candidate with that
    /// stem and can never be the quarantine folder.
    fn check_state_folder(&self, path: &Path, stem: &str) -> Result<(), LoadError> {
        if stem == self.config.failed_dir {
            return Err(LoadError::StateDir {
                reason: format!("'{stem}' is reserved for quarantined files"),
            });
        }

        let owner = self.candidates()?.into_iter().find(|candidate| {
            self.backend_for(candidate).is_some()
                && candidate.file_stem().and_then(|s| s.to_str()) == Some(stem)
        });
        match owner {
            Some(owner) if owner != path => Err(LoadError::StateDir {
                reason: format!("'{stem}' already belongs to {}", file_name(&owner)),
            }),
            _ => Ok(()),
        }
    }

    async fn install_requirements(&self, requirements: &[String]) -> Result<(), LoadError> {
        let Some((program, args)) = self
            .config
            .requirements_command
            .as_deref()
            .and_then(|command| command.split_first())
        else {
            info!(
                requirements = ?requirements,
                "Plugin declares requirements but no requirements command is configured"
            );
            return Ok(());
        };

        info!(command = %program, requirements = ?requirements, "Installing plugin requirements");
        let output = tokio::process::Command::new(program)
            .args(args)
            .args(requirements)
            .output()
            .await
            .map_err(|e| LoadError::DependencyInstall {
                reason: format!("Failed to run {program}: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LoadError::DependencyInstall {
                reason: format!("{program} exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }

    /// Move a failed file into the quarantine folder
    pub fn quarantine(&self, path: &Path, reason: &str) -> QuarantineRecord {
        let failed_dir = self.config.failed_path();
        let mut target = failed_dir.join(file_name(path));

        if target.exists() {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let suffix = Utc::now().format("%Y%m%d%H%M%S%3f");
            let name = match path.extension() {
                Some(ext) => format!("{stem}-{suffix}.{}", ext.to_string_lossy()),
                None => format!("{stem}-{suffix}"),
            };
            target = failed_dir.join(name);
        }

        let moved = std::fs::create_dir_all(&failed_dir).and_then(|_| std::fs::rename(path, &target));
        match moved {
            Ok(()) => warn!(
                file = %path.display(),
                target = %target.display(),
                "Moved plugin to quarantine"
            ),
            Err(e) => error!(
                file = %path.display(),
                error = %e,
                "Failed to move plugin to quarantine"
            ),
        }

        QuarantineRecord::new(file_name(&target), reason)
    }
}

/// Ensure `<dir>/<stem>/valves.json` exists, returning its path
fn prepare_state_dir(state_dir: &Path) -> Result<PathBuf, LoadError> {
    let state_error = |e: std::io::Error| LoadError::StateDir {
        reason: format!("{}: {e}", state_dir.display()),
    };

    std::fs::create_dir_all(state_dir).map_err(state_error)?;
    let sidecar = state_dir.join("valves.json");
    if !sidecar.exists() {
        std::fs::write(&sidecar, "{}").map_err(state_error)?;
    }
    Ok(sidecar)
}

async fn run_startup(module: &Arc<PluginModule>) {
    if !module.capabilities.on_startup {
        return;
    }
    let task_module = module.clone();
    let result = tokio::task::spawn_blocking(move || task_module.startup()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(module = %module.id, error = %e, "Plugin on_startup failed"),
        Err(e) => error!(module = %module.id, error = %e, "Plugin on_startup panicked"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
