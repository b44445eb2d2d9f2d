//! Plugin-facing data types
//!
//! Requests handed to plugins, the outcomes they return, and the errors that
//! may cross the plugin boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::plugin::valves::Valves;

/// What a plugin (or a registry entry derived from it) is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    #[default]
    Pipe,
    Filter,
    Manifold,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineKind::Pipe => "pipe",
            PipelineKind::Filter => "filter",
            PipelineKind::Manifold => "manifold",
        };
        f.write_str(name)
    }
}

/// Identity a plugin declares about itself. Every field is optional; the
/// loader falls back to the file stem for the id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: PipelineKind,
}

impl PluginManifest {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            id: None,
            name: None,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Which optional entry points a plugin really implements.
///
/// Resolved once when the plugin is loaded; dispatch and filter invocation
/// consult this table instead of probing the plugin on every call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub pipe: bool,
    pub inlet: bool,
    pub outlet: bool,
    pub on_startup: bool,
    pub on_shutdown: bool,
    pub on_valves_updated: bool,
}

impl Capabilities {
    pub fn pipe() -> Self {
        Self {
            pipe: true,
            ..Self::default()
        }
    }

    pub fn filter() -> Self {
        Self {
            inlet: true,
            outlet: true,
            ..Self::default()
        }
    }

    /// A plugin needs a completion entry point or at least one filter hook.
    pub fn is_loadable(&self) -> bool {
        self.pipe || self.inlet || self.outlet
    }

    /// Parse the capability names a process plugin reports in `describe`.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut caps = Self::default();
        for name in names {
            match name {
                "pipe" => caps.pipe = true,
                "inlet" => caps.inlet = true,
                "outlet" => caps.outlet = true,
                "on_startup" => caps.on_startup = true,
                "on_shutdown" => caps.on_shutdown = true,
                "on_valves_updated" => caps.on_valves_updated = true,
                _ => {}
            }
        }
        caps
    }
}

/// One selectable model inside a manifold plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubModel {
    pub id: String,
    pub name: String,
}

impl SubModel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A chat message as received on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,

    /// Either a plain string or a list of typed content parts
    #[serde(default)]
    pub content: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            extra: Map::new(),
        }
    }

    /// Text content of the message; for part lists the `text` parts are joined.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// An OpenAI-style chat completion request.
///
/// The untouched request body is kept alongside the parsed fields so plugins
/// see every passthrough field.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub body: Value,
}

#[derive(Deserialize)]
struct CompletionRequestFields {
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
}

impl CompletionRequest {
    pub fn from_body(body: Value) -> Result<Self, serde_json::Error> {
        let fields: CompletionRequestFields = serde_json::from_value(body.clone())?;
        Ok(Self {
            model: fields.model,
            messages: fields.messages,
            stream: fields.stream,
            body,
        })
    }

    pub fn last_user_message(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(ChatMessage::text)
    }
}

/// Arguments of a plugin's completion entry point
#[derive(Debug, Clone)]
pub struct PipeCall {
    /// Text of the last user message
    pub user_message: String,
    /// Own id for plain pipes, the submodel id for manifold submodels
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub body: Value,
    pub valves: Arc<Valves>,
    /// Cancelled when the caller gave up (deadline passed or client gone)
    pub cancel: CancellationToken,
}

/// A single element of a lazily produced completion
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Json(Value),
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Fragment::Text(text)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Fragment::Text(text.to_string())
    }
}

impl From<Value> for Fragment {
    fn from(value: Value) -> Self {
        Fragment::Json(value)
    }
}

pub type FragmentStream = Box<dyn Iterator<Item = Result<Fragment, PluginError>> + Send>;

/// What a completion entry point returns
pub enum CompletionOutcome {
    Text(String),
    Json(Value),
    Stream(FragmentStream),
}

impl CompletionOutcome {
    pub fn stream<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = Result<Fragment, PluginError>>,
        I::IntoIter: Send + 'static,
    {
        CompletionOutcome::Stream(Box::new(fragments.into_iter()))
    }

    /// Stream of infallible text fragments
    pub fn text_stream<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: Send + 'static,
        S: Into<String>,
    {
        CompletionOutcome::Stream(Box::new(
            fragments
                .into_iter()
                .map(|fragment| Ok(Fragment::Text(fragment.into()))),
        ))
    }
}

impl fmt::Debug for CompletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionOutcome::Text(text) => f.debug_tuple("Text").field(text).finish(),
            CompletionOutcome::Json(value) => f.debug_tuple("Json").field(value).finish(),
            CompletionOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Errors raised by or while talking to a plugin
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin itself raised; the message is surfaced verbatim
    #[error("{reason}")]
    Runtime { reason: String },

    #[error("Plugin does not implement '{capability}'")]
    Unsupported { capability: &'static str },

    #[error("Plugin timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Plugin call cancelled")]
    Cancelled,

    #[error("Failed to spawn plugin process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Plugin returned invalid JSON: {reason}")]
    InvalidOutput { reason: String },

    #[error("Plugin I/O error: {reason}")]
    IoError { reason: String },
}

impl PluginError {
    pub fn runtime(reason: impl Into<String>) -> Self {
        PluginError::Runtime {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_passthrough_fields() {
        let body = json!({
            "model": "echo",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "user": {"id": "u1"}
        });

        let request = CompletionRequest::from_body(body.clone()).unwrap();
        assert_eq!(request.model, "echo");
        assert!(!request.stream);
        assert_eq!(request.body, body);
        assert_eq!(request.body["temperature"], 0.2);
    }

    #[test]
    fn test_last_user_message_with_content_parts() {
        let request = CompletionRequest::from_body(json!({
            "model": "echo",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [
                    {"type": "text", "text": "look at "},
                    {"type": "image_url", "image_url": {"url": "http://x"}},
                    {"type": "text", "text": "this"}
                ]},
                {"role": "system", "content": "trailing"}
            ]
        }))
        .unwrap();

        assert_eq!(request.last_user_message().as_deref(), Some("look at this"));
    }

    #[test]
    fn test_request_without_model_is_rejected() {
        assert!(CompletionRequest::from_body(json!({"messages": []})).is_err());
    }

    #[test]
    fn test_capabilities_from_names() {
        let caps = Capabilities::from_names(["pipe", "on_startup", "bogus"]);
        assert!(caps.pipe);
        assert!(caps.on_startup);
        assert!(!caps.inlet);
        assert!(caps.is_loadable());
        assert!(!Capabilities::default().is_loadable());
    }

    #[test]
    fn test_manifest_deserialization_defaults_to_pipe() {
        let manifest: PluginManifest = serde_json::from_value(json!({"name": "X"})).unwrap();
        assert_eq!(manifest.kind, PipelineKind::Pipe);
        assert_eq!(manifest.name.as_deref(), Some("X"));

        let manifest: PluginManifest =
            serde_json::from_value(json!({"type": "manifold"})).unwrap();
        assert_eq!(manifest.kind, PipelineKind::Manifold);
    }
}
