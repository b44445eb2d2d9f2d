//! Pipeline plugin system
//!
//! Plugins are discovered as files in a directory and brought to life by one
//! of two backends that implement the same [`Pipeline`] contract:
//!
//! - **Native**: a `.toml` manifest selecting a factory compiled into the
//!   host ([`NativeCatalog`])
//! - **Process**: a script run by a configured interpreter, speaking
//!   newline-delimited JSON over stdin/stdout ([`ProcessPipeline`])
//!
//! # Modules
//!
//! - `loader`: directory scanning, load steps and quarantine
//! - `manager`: lifecycle mutations (reload, add, delete, valves updates)
//! - `pipeline`: the plugin trait
//! - `module`: a loaded plugin and its bookkeeping
//! - `valves`: per-plugin configuration schema, validation and persistence
//! - `frontmatter`: leading metadata block of a source file
//! - `native`, `builtin`: compiled-in plugins
//! - `process`: process spawning, IPC and pooling
//! - `schema`: plugin-facing data types and errors

pub mod builtin;
pub mod frontmatter;
pub mod loader;
pub mod manager;
pub mod module;
pub mod native;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod valves;

pub use loader::{LoadReport, PluginLoader};
pub use manager::PluginManager;
pub use module::{ModuleState, PluginModule, QuarantineRecord};
pub use native::{NativeCatalog, NativeManifest};
pub use pipeline::Pipeline;
pub use process::{PluginProcess, ProcessPipeline, ProcessPool};
pub use schema::{
    Capabilities, CompletionOutcome, CompletionRequest, Fragment, PipeCall, PipelineKind,
    PluginError, PluginManifest, SubModel,
};
pub use valves::{Valves, ValvesError, ValvesHandle, ValvesSchema};
