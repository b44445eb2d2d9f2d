//! Converts plugin outcomes into the OpenAI wire protocol
//!
//! A completion is either one JSON object or a sequence of server-sent event
//! frames (`data: <json>\n\n`) terminated by `data: [DONE]\n\n`.

use bytes::Bytes;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::plugin::schema::{CompletionOutcome, Fragment, FragmentStream, PluginError};

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Result of normalizing one outcome
pub enum Normalized {
    Json(Value),
    Events(EventFrames),
}

impl std::fmt::Debug for Normalized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Normalized::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Normalized::Events(_) => f.write_str("Events(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    model: String,
}

impl Normalizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    pub fn normalize(
        &self,
        outcome: CompletionOutcome,
        stream: bool,
    ) -> Result<Normalized, PluginError> {
        match (outcome, stream) {
            // the plugin owns the wire shape
            (CompletionOutcome::Json(value), _) => Ok(Normalized::Json(value)),
            (CompletionOutcome::Text(text), false) => Ok(Normalized::Json(self.completion(&text))),
            (CompletionOutcome::Text(text), true) => Ok(Normalized::Events(EventFrames::new(
                self.clone(),
                Box::new(std::iter::once(Ok(Fragment::Text(text)))),
            ))),
            (CompletionOutcome::Stream(fragments), true) => {
                Ok(Normalized::Events(EventFrames::new(self.clone(), fragments)))
            }
            (CompletionOutcome::Stream(fragments), false) => self.drain(fragments).map(Normalized::Json),
        }
    }

    /// Pull a fragment stream to the end and build one response object
    fn drain(&self, fragments: FragmentStream) -> Result<Value, PluginError> {
        let mut content = String::new();
        let mut last_object = None;

        for fragment in fragments {
            let fragment = match fragment? {
                Fragment::Text(text) => match text.strip_prefix("data:").map(str::trim) {
                    Some("[DONE]") => continue,
                    Some(payload) => match serde_json::from_str(payload) {
                        Ok(value) => Fragment::Json(value),
                        Err(_) => Fragment::Text(payload.to_string()),
                    },
                    None => Fragment::Text(text),
                },
                json => json,
            };

            match fragment {
                Fragment::Text(text) => content.push_str(&text),
                Fragment::Json(value) => match value.pointer("/choices/0/delta") {
                    Some(delta) => {
                        if let Some(text) = delta.get("content").and_then(Value::as_str) {
                            content.push_str(text);
                        }
                    }
                    None => last_object = Some(value),
                },
            }
        }

        Ok(last_object.unwrap_or_else(|| self.completion(&content)))
    }

    pub fn completion(&self, content: &str) -> Value {
        json!({
            "id": self.fresh_id(),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": content,
                },
                "logprobs": null,
                "finish_reason": "stop",
            }],
        })
    }

    /// A delta chunk, or the finish chunk when `content` is `None`
    pub fn chunk(&self, content: Option<&str>) -> Value {
        let (delta, finish_reason) = match content {
            Some(content) => (json!({ "content": content }), Value::Null),
            None => (json!({}), json!("stop")),
        };
        json!({
            "id": self.fresh_id(),
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "logprobs": null,
                "finish_reason": finish_reason,
            }],
        })
    }

    fn fresh_id(&self) -> String {
        format!("{}-{}", self.model, Uuid::new_v4())
    }
}

pub fn frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Body,
    Finish,
    Done,
    Finished,
}

/// Lazily produced SSE frames for one streamed completion.
///
/// Pulling a frame pulls the plugin's fragment iterator, so this must be
/// driven from the worker pool.
pub struct EventFrames {
    normalizer: Normalizer,
    fragments: FragmentStream,
    /// Whether any text fragment, templated or passed through, was seen
    saw_text: bool,
    saw_json: bool,
    state: FrameState,
}

impl EventFrames {
    fn new(normalizer: Normalizer, fragments: FragmentStream) -> Self {
        Self {
            normalizer,
            fragments,
            saw_text: false,
            saw_json: false,
            state: FrameState::Body,
        }
    }
}

impl Iterator for EventFrames {
    type Item = Result<Bytes, PluginError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                FrameState::Body => match self.fragments.next() {
                    Some(Ok(Fragment::Text(text))) => {
                        self.saw_text = true;
                        if let Some(payload) = text.strip_prefix("data:") {
                            if payload.trim() == "[DONE]" {
                                continue;
                            }
                            return Some(Ok(passthrough(text)));
                        }
                        return Some(Ok(frame(&self.normalizer.chunk(Some(&text)))));
                    }
                    Some(Ok(Fragment::Json(value))) => {
                        self.saw_json = true;
                        return Some(Ok(frame(&value)));
                    }
                    Some(Err(e)) => {
                        self.state = FrameState::Finished;
                        return Some(Err(e));
                    }
                    None => {
                        // only a purely structured stream owns its own ending
                        self.state = if self.saw_text || !self.saw_json {
                            FrameState::Finish
                        } else {
                            FrameState::Done
                        };
                    }
                },
                FrameState::Finish => {
                    self.state = FrameState::Done;
                    return Some(Ok(frame(&self.normalizer.chunk(None))));
                }
                FrameState::Done => {
                    self.state = FrameState::Finished;
                    return Some(Ok(Bytes::from_static(DONE_FRAME)));
                }
                FrameState::Finished => return None,
            }
        }
    }
}

/// Forward an already formatted SSE line, completing its frame terminator
fn passthrough(line: String) -> Bytes {
    if line.ends_with("\n\n") {
        return Bytes::from(line);
    }
    let mut line = line.trim_end_matches('\n').to_string();
    line.push_str("\n\n");
    Bytes::from(line)
}
