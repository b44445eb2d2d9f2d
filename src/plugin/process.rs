//! Out-of-process plugins
//!
//! A plugin file with an interpreter mapping (e.g. `.py` → `python3`) runs as
//! a child process speaking newline-delimited JSON over stdin/stdout. Each
//! request is one line `{"method": ..., "params": ...}`; replies are lines
//! carrying one of `result`, `chunk`, `done` or `error`. Streaming completions
//! send any number of `chunk` lines followed by `{"done": true}`.
//!
//! Processes are pooled per plugin. A process is only returned to the pool
//! after a clean exchange; on I/O errors, timeouts or an abandoned stream it
//! is killed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::LoadError;
use crate::plugin::pipeline::Pipeline;
use crate::plugin::schema::{
    Capabilities, CompletionOutcome, Fragment, PipeCall, PipelineKind, PluginError,
    PluginManifest, SubModel,
};
use crate::plugin::valves::{Valves, ValvesSchema};

#[derive(Debug, Serialize)]
struct ProcessRequest<'a> {
    method: &'a str,
    params: Value,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    chunk: Option<Value>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Reply to the `describe` handshake
#[derive(Debug, Default, Deserialize)]
struct Description {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: PipelineKind,
    #[serde(default)]
    pipelines: Vec<SubModel>,
    #[serde(default)]
    valves: Option<Value>,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// A running plugin process
pub struct PluginProcess {
    pub pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PluginProcess {
    pub fn spawn(interpreter: &Path, plugin_path: &Path) -> Result<Self, PluginError> {
        let mut child = Command::new(interpreter)
            .arg(plugin_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PluginError::SpawnFailed {
                reason: format!("{}: {}", interpreter.display(), e),
            })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(PluginError::SpawnFailed {
                reason: "stdio pipes unavailable".to_string(),
            });
        };

        debug!(pid, plugin = %plugin_path.display(), "Spawned plugin process");
        Ok(Self {
            pid,
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    pub fn is_healthy(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    fn send(&mut self, method: &str, params: Value) -> Result<(), PluginError> {
        let line = serde_json::to_string(&ProcessRequest { method, params }).map_err(|e| {
            PluginError::IoError {
                reason: format!("Failed to serialize request: {e}"),
            }
        })?;
        writeln!(self.stdin, "{line}")
            .and_then(|_| self.stdin.flush())
            .map_err(|e| PluginError::IoError {
                reason: format!("Failed to write to stdin: {e}"),
            })
    }

    fn read_reply(&mut self) -> Result<ProcessReply, PluginError> {
        loop {
            let mut line = String::new();
            let read = self
                .stdout
                .read_line(&mut line)
                .map_err(|e| PluginError::IoError {
                    reason: format!("Failed to read from stdout: {e}"),
                })?;
            if read == 0 {
                return Err(PluginError::IoError {
                    reason: "stdout closed unexpectedly".to_string(),
                });
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return serde_json::from_str(line).map_err(|e| PluginError::InvalidOutput {
                reason: format!("{e}: {line}"),
            });
        }
    }

    /// Kill the process once the token is cancelled. The watch ends when the
    /// returned guard is dropped.
    fn watch(&self, cancel: &CancellationToken) -> Option<DropGuard> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let finished = CancellationToken::new();
        let child = self.child.clone();
        let cancel = cancel.clone();
        let watch = finished.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Ok(mut child) = child.lock() {
                        let _ = child.kill();
                    }
                }
                _ = watch.cancelled() => {}
            }
        });
        Some(finished.drop_guard())
    }

    pub fn kill(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Pool of warm processes for one plugin file
pub struct ProcessPool {
    interpreter: PathBuf,
    plugin_path: PathBuf,
    max_size: usize,
    processes: Mutex<VecDeque<PluginProcess>>,
}

impl ProcessPool {
    pub fn new(interpreter: PathBuf, plugin_path: PathBuf, max_size: usize) -> Self {
        Self {
            interpreter,
            plugin_path,
            max_size,
            processes: Mutex::new(VecDeque::with_capacity(max_size)),
        }
    }

    /// Take a healthy idle process or spawn a new one
    pub fn acquire(&self) -> Result<PluginProcess, PluginError> {
        if let Ok(mut processes) = self.processes.lock() {
            while let Some(process) = processes.pop_front() {
                if process.is_healthy() {
                    return Ok(process);
                }
                // dropping kills it
            }
        }
        PluginProcess::spawn(&self.interpreter, &self.plugin_path)
    }

    pub fn release(&self, process: PluginProcess) {
        if let Ok(mut processes) = self.processes.lock() {
            if processes.len() < self.max_size && process.is_healthy() {
                processes.push_back(process);
            }
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.clear();
        }
    }

    pub fn size(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// One request/response exchange
    fn call(&self, method: &str, params: Value) -> Result<Value, PluginError> {
        let mut process = self.acquire()?;
        process.send(method, params)?;
        let reply = process.read_reply()?;
        self.release(process);
        match reply.error {
            Some(reason) => Err(PluginError::Runtime { reason }),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        }
    }
}

/// [`Pipeline`] backed by a pool of child processes
pub struct ProcessPipeline {
    pool: Arc<ProcessPool>,
    manifest: PluginManifest,
    capabilities: Capabilities,
    dynamic_pipelines: bool,
    schema: ValvesSchema,
    submodels: RwLock<Vec<SubModel>>,
}

impl ProcessPipeline {
    /// Start the plugin and run the `describe` handshake
    pub fn launch(
        interpreter: PathBuf,
        plugin_path: PathBuf,
        pool_size: usize,
    ) -> Result<Self, LoadError> {
        let pool = Arc::new(ProcessPool::new(interpreter, plugin_path, pool_size));
        let described = pool.call("describe", json!({})).map_err(|e| match e {
            PluginError::SpawnFailed { reason } => LoadError::Import { reason },
            other => LoadError::Instantiation {
                reason: other.to_string(),
            },
        })?;

        let description: Description =
            serde_json::from_value(described).map_err(|e| LoadError::Instantiation {
                reason: format!("invalid describe reply: {e}"),
            })?;
        let schema = match &description.valves {
            Some(valves) => ValvesSchema::from_json_schema(valves)?,
            None => ValvesSchema::default(),
        };

        Ok(Self {
            pool,
            manifest: PluginManifest {
                id: description.id,
                name: description.name,
                kind: description.kind,
            },
            capabilities: Capabilities::from_names(
                description.capabilities.iter().map(String::as_str),
            ),
            dynamic_pipelines: description.capabilities.iter().any(|c| c == "pipelines"),
            schema,
            submodels: RwLock::new(description.pipelines),
        })
    }

    pub fn pool(&self) -> &Arc<ProcessPool> {
        &self.pool
    }

    fn hook(&self, method: &str, valves: &Valves) -> Result<(), PluginError> {
        self.pool
            .call(method, json!({ "valves": valves }))
            .map(|_| ())
    }

    fn filter(
        &self,
        method: &str,
        valves: &Valves,
        body: Value,
        user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        self.pool.call(
            method,
            json!({ "valves": valves, "body": body, "user": user }),
        )
    }
}

impl Pipeline for ProcessPipeline {
    fn manifest(&self) -> PluginManifest {
        self.manifest.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn valves_schema(&self) -> ValvesSchema {
        self.schema.clone()
    }

    fn pipelines(&self, _valves: &Valves) -> Result<Vec<SubModel>, PluginError> {
        self.submodels
            .read()
            .map(|submodels| submodels.clone())
            .map_err(|_| PluginError::runtime("submodel list poisoned"))
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        let mut process = self.pool.acquire()?;
        let guard = process.watch(&call.cancel);
        process.send(
            "pipe",
            json!({
                "user_message": call.user_message,
                "model_id": call.model_id,
                "messages": call.messages,
                "body": call.body,
                "valves": call.valves.as_ref(),
            }),
        )?;

        let reply = process.read_reply().map_err(|e| {
            if call.cancel.is_cancelled() {
                PluginError::Cancelled
            } else {
                e
            }
        })?;

        if let Some(reason) = reply.error {
            drop(guard);
            self.pool.release(process);
            return Err(PluginError::Runtime { reason });
        }

        if let Some(chunk) = reply.chunk {
            return Ok(CompletionOutcome::Stream(Box::new(ProcessStream {
                pending: Some(chunk_fragment(chunk)),
                process: Some(process),
                pool: self.pool.clone(),
                cancel: call.cancel,
                _guard: guard,
            })));
        }

        drop(guard);
        self.pool.release(process);

        if reply.done {
            return Ok(CompletionOutcome::text_stream(Vec::<String>::new()));
        }
        match reply.result {
            Some(Value::String(text)) => Ok(CompletionOutcome::Text(text)),
            Some(Value::Object(mut result)) => {
                if let Some(Value::String(text)) = result.remove("text") {
                    Ok(CompletionOutcome::Text(text))
                } else if let Some(value) = result.remove("json") {
                    Ok(CompletionOutcome::Json(value))
                } else {
                    Ok(CompletionOutcome::Json(Value::Object(result)))
                }
            }
            Some(other) => Ok(CompletionOutcome::Json(other)),
            None => Err(PluginError::InvalidOutput {
                reason: "pipe reply carried no result".to_string(),
            }),
        }
    }

    fn inlet(
        &self,
        valves: &Valves,
        body: Value,
        user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        self.filter("inlet", valves, body, user)
    }

    fn outlet(
        &self,
        valves: &Valves,
        body: Value,
        user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        self.filter("outlet", valves, body, user)
    }

    fn on_startup(&self, valves: &Valves) -> Result<(), PluginError> {
        self.hook("on_startup", valves)
    }

    fn on_shutdown(&self, valves: &Valves) -> Result<(), PluginError> {
        let result = self.hook("on_shutdown", valves);
        self.pool.shutdown();
        result
    }

    fn on_valves_updated(&self, valves: &Valves) -> Result<(), PluginError> {
        if self.capabilities.on_valves_updated {
            self.hook("on_valves_updated", valves)?;
        }
        if self.dynamic_pipelines {
            let listed = self.pool.call("pipelines", json!({ "valves": valves }))?;
            let submodels: Vec<SubModel> =
                serde_json::from_value(listed).map_err(|e| PluginError::InvalidOutput {
                    reason: format!("invalid pipelines reply: {e}"),
                })?;
            if let Ok(mut current) = self.submodels.write() {
                *current = submodels;
            }
        }
        Ok(())
    }
}

fn chunk_fragment(chunk: Value) -> Fragment {
    match chunk {
        Value::String(text) => Fragment::Text(text),
        other => Fragment::Json(other),
    }
}

/// Streamed `pipe` reply. Holds the process until `done`; dropping it early
/// kills the process.
struct ProcessStream {
    pending: Option<Fragment>,
    process: Option<PluginProcess>,
    pool: Arc<ProcessPool>,
    cancel: CancellationToken,
    _guard: Option<DropGuard>,
}

impl Iterator for ProcessStream {
    type Item = Result<Fragment, PluginError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(fragment) = self.pending.take() {
            return Some(Ok(fragment));
        }
        let process = self.process.as_mut()?;

        if self.cancel.is_cancelled() {
            self.process = None;
            return Some(Err(PluginError::Cancelled));
        }

        match process.read_reply() {
            Ok(ProcessReply { error: Some(reason), .. }) => {
                if let Some(process) = self.process.take() {
                    self.pool.release(process);
                }
                Some(Err(PluginError::Runtime { reason }))
            }
            Ok(ProcessReply { chunk: Some(chunk), .. }) => Some(Ok(chunk_fragment(chunk))),
            Ok(ProcessReply { done: true, .. }) => {
                if let Some(process) = self.process.take() {
                    self.pool.release(process);
                }
                None
            }
            Ok(_) => {
                self.process = None;
                Some(Err(PluginError::InvalidOutput {
                    reason: "expected chunk, done or error".to_string(),
                }))
            }
            Err(e) => {
                self.process = None;
                if self.cancel.is_cancelled() {
                    Some(Err(PluginError::Cancelled))
                } else {
                    warn!(error = %e, "Plugin stream broke off");
                    Some(Err(e))
                }
            }
        }
    }
}
