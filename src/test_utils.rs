//! Scripted plugins and helpers shared by unit tests

use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::plugin::frontmatter::SourceMetadata;
use crate::plugin::module::PluginModule;
use crate::plugin::pipeline::Pipeline;
use crate::plugin::schema::{
    Capabilities, CompletionOutcome, Fragment, PipeCall, PipelineKind, PluginError,
    PluginManifest, SubModel,
};
use crate::plugin::valves::{Valves, ValvesHandle, ValvesSchema};

/// Wrap a pipeline into a registered-looking module whose state folder lives
/// under `dir`
pub fn module_from(dir: &Path, id: &str, pipeline: impl Pipeline + 'static) -> Arc<PluginModule> {
    let manifest = pipeline.manifest();
    let state_dir = dir.join(id);
    std::fs::create_dir_all(&state_dir).unwrap();
    let valves =
        ValvesHandle::load(pipeline.valves_schema(), state_dir.join("valves.json")).unwrap();

    Arc::new(PluginModule::new(
        id.to_string(),
        manifest.name,
        dir.join(format!("{id}.toml")),
        SourceMetadata::default(),
        manifest.kind,
        pipeline.capabilities(),
        valves,
        Arc::new(pipeline),
    ))
}

#[derive(Clone)]
pub enum Reply {
    Text(String),
    Json(Value),
    Fragments(Vec<Fragment>),
    /// Fragments produced with a pause before each one
    SlowFragments(Vec<String>, Duration),
    /// Fragments followed by an error
    BreakOff(Vec<String>, String),
    Fail(String),
    /// Blocks until cancelled or the duration passes
    Hang(Duration),
}

/// A pipe answering with a fixed reply
#[derive(Clone)]
pub struct ScriptedPipe {
    pub name: Option<String>,
    pub reply: Reply,
}

impl ScriptedPipe {
    pub fn new(reply: Reply) -> Self {
        Self { name: None, reply }
    }

    pub fn text(text: &str) -> Self {
        Self::new(Reply::Text(text.to_string()))
    }

    pub fn json(value: Value) -> Self {
        Self::new(Reply::Json(value))
    }

    pub fn fragments(fragments: &[&str]) -> Self {
        Self::new(Reply::Fragments(
            fragments.iter().map(|f| Fragment::from(*f)).collect(),
        ))
    }

    pub fn fail(message: &str) -> Self {
        Self::new(Reply::Fail(message.to_string()))
    }
}

impl Pipeline for ScriptedPipe {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            id: None,
            name: self.name.clone(),
            kind: PipelineKind::Pipe,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::pipe()
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        match self.reply.clone() {
            Reply::Text(text) => Ok(CompletionOutcome::Text(text)),
            Reply::Json(value) => Ok(CompletionOutcome::Json(value)),
            Reply::Fragments(fragments) => Ok(CompletionOutcome::stream(
                fragments.into_iter().map(Ok),
            )),
            Reply::SlowFragments(fragments, pause) => Ok(CompletionOutcome::stream(
                fragments.into_iter().map(move |fragment| {
                    std::thread::sleep(pause);
                    Ok(Fragment::Text(fragment))
                }),
            )),
            Reply::BreakOff(fragments, error) => Ok(CompletionOutcome::stream(
                fragments
                    .into_iter()
                    .map(|fragment| Ok(Fragment::Text(fragment)))
                    .chain(std::iter::once(Err(PluginError::runtime(error)))),
            )),
            Reply::Fail(message) => Err(PluginError::runtime(message)),
            Reply::Hang(duration) => {
                let started = Instant::now();
                while started.elapsed() < duration {
                    if call.cancel.is_cancelled() {
                        return Err(PluginError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(CompletionOutcome::Text("late".to_string()))
            }
        }
    }
}

/// Manifold with a fixed submodel list, replying `"{model_id}:{message}"`
pub struct ScriptedManifold {
    submodels: Vec<SubModel>,
    name: Option<String>,
}

impl ScriptedManifold {
    pub fn new(submodels: Vec<SubModel>) -> Self {
        Self {
            submodels,
            name: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

impl Pipeline for ScriptedManifold {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            id: None,
            name: self.name.clone(),
            kind: PipelineKind::Manifold,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::pipe()
    }

    fn pipelines(&self, _valves: &Valves) -> Result<Vec<SubModel>, PluginError> {
        Ok(self.submodels.clone())
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        Ok(CompletionOutcome::Text(format!(
            "{}:{}",
            call.model_id, call.user_message
        )))
    }
}

/// Filter tagging bodies on the way in and out; rejects when its `reject`
/// valve is set
pub struct ScriptedFilter {
    schema: ValvesSchema,
}

impl ScriptedFilter {
    pub fn new(pipelines: &[&str], priority: i64) -> Self {
        Self {
            schema: ValvesSchema::new("ScriptedFilterValves")
                .string_list("pipelines", pipelines)
                .integer("priority", priority)
                .boolean("reject", false),
        }
    }

    /// A filter declaring no valves at all
    pub fn bare() -> Self {
        Self {
            schema: ValvesSchema::default(),
        }
    }
}

impl Pipeline for ScriptedFilter {
    fn manifest(&self) -> PluginManifest {
        PluginManifest::new(PipelineKind::Filter)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::filter()
    }

    fn valves_schema(&self) -> ValvesSchema {
        self.schema.clone()
    }

    fn inlet(
        &self,
        valves: &Valves,
        mut body: Value,
        user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        if valves.get_bool("reject").unwrap_or(false) {
            return Err(PluginError::runtime("rejected by filter"));
        }
        body["inlet"] = Value::Bool(true);
        if let Some(user) = user {
            body["user"] = user.clone();
        }
        Ok(body)
    }

    fn outlet(
        &self,
        _valves: &Valves,
        mut body: Value,
        _user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        body["outlet"] = Value::Bool(true);
        Ok(body)
    }
}

/// Counts lifecycle hook invocations
#[derive(Default)]
pub struct HookCounts {
    pub startup: AtomicUsize,
    pub shutdown: AtomicUsize,
    pub valves_updated: AtomicUsize,
}

impl HookCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Pipe with every lifecycle hook and a `greeting` valve
pub struct HookedPipe {
    pub counts: Arc<HookCounts>,
    pub fail_startup: bool,
}

impl HookedPipe {
    pub fn new(counts: Arc<HookCounts>) -> Self {
        Self {
            counts,
            fail_startup: false,
        }
    }
}

impl Pipeline for HookedPipe {
    fn manifest(&self) -> PluginManifest {
        PluginManifest::new(PipelineKind::Pipe).with_name("Hooked")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            pipe: true,
            on_startup: true,
            on_shutdown: true,
            on_valves_updated: true,
            ..Capabilities::default()
        }
    }

    fn valves_schema(&self) -> ValvesSchema {
        ValvesSchema::new("HookedValves").string("greeting", "hi")
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        Ok(CompletionOutcome::Text(format!(
            "{} {}",
            call.valves.get_str("greeting").unwrap_or_default(),
            call.user_message
        )))
    }

    fn on_startup(&self, _valves: &Valves) -> Result<(), PluginError> {
        self.counts.startup.fetch_add(1, Ordering::SeqCst);
        if self.fail_startup {
            return Err(PluginError::runtime("startup failed"));
        }
        Ok(())
    }

    fn on_shutdown(&self, _valves: &Valves) -> Result<(), PluginError> {
        self.counts.shutdown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_valves_updated(&self, _valves: &Valves) -> Result<(), PluginError> {
        self.counts.valves_updated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
