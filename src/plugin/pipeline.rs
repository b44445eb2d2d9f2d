//! The plugin contract
//!
//! Every backend (compiled-in native plugins and out-of-process plugins)
//! implements [`Pipeline`]. Entry points are synchronous and may block; the
//! host always calls them from the worker pool, never from the async reactor.

use serde_json::Value;

use crate::plugin::schema::{
    Capabilities, CompletionOutcome, PipeCall, PluginError, PluginManifest, SubModel,
};
use crate::plugin::valves::{Valves, ValvesSchema};

pub trait Pipeline: Send + Sync {
    /// Declared identity and kind
    fn manifest(&self) -> PluginManifest;

    /// Entry points this plugin implements; read once at load time
    fn capabilities(&self) -> Capabilities;

    fn valves_schema(&self) -> ValvesSchema {
        ValvesSchema::default()
    }

    /// Submodels of a manifold. Called on every registry rebuild, so it
    /// should be cheap.
    fn pipelines(&self, _valves: &Valves) -> Result<Vec<SubModel>, PluginError> {
        Ok(Vec::new())
    }

    /// Completion entry point
    fn pipe(&self, _call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        Err(PluginError::Unsupported { capability: "pipe" })
    }

    fn inlet(
        &self,
        _valves: &Valves,
        body: Value,
        _user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        Ok(body)
    }

    fn outlet(
        &self,
        _valves: &Valves,
        body: Value,
        _user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        Ok(body)
    }

    fn on_startup(&self, _valves: &Valves) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_shutdown(&self, _valves: &Valves) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_valves_updated(&self, _valves: &Valves) -> Result<(), PluginError> {
        Ok(())
    }
}
