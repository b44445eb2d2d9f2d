//! Plugins shipped with the host, one of each kind

use serde_json::Value;

use crate::plugin::native::NativeCatalog;
use crate::plugin::pipeline::Pipeline;
use crate::plugin::schema::{
    Capabilities, CompletionOutcome, Fragment, PipeCall, PipelineKind, PluginError,
    PluginManifest, SubModel,
};
use crate::plugin::valves::{ValveField, ValveType, Valves, ValvesSchema};

pub fn register(catalog: &mut NativeCatalog) {
    catalog
        .register("echo", || Ok(EchoPipeline))
        .register("multi_echo", || Ok(MultiEchoPipeline))
        .register("turn_limit", || Ok(TurnLimitFilter));
}

/// Replies with the last user message, word by word when streaming.
pub struct EchoPipeline;

impl Pipeline for EchoPipeline {
    fn manifest(&self) -> PluginManifest {
        PluginManifest::new(PipelineKind::Pipe).with_name("Echo")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::pipe()
    }

    fn valves_schema(&self) -> ValvesSchema {
        ValvesSchema::new("EchoValves")
            .field(
                ValveField::new("prefix", ValveType::String, "")
                    .describe("Text prepended to every reply"),
            )
            .boolean("stream_by_word", true)
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        let text = format!(
            "{}{}",
            call.valves.get_str("prefix").unwrap_or_default(),
            call.user_message
        );
        let wants_stream = call
            .body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !wants_stream || !call.valves.get_bool("stream_by_word").unwrap_or(true) {
            return Ok(CompletionOutcome::Text(text));
        }

        let cancel = call.cancel;
        let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
        Ok(CompletionOutcome::stream(
            words
                .into_iter()
                .take_while(move |_| !cancel.is_cancelled())
                .map(|word| Ok(Fragment::Text(word))),
        ))
    }
}

/// Manifold exposing one echo submodel per entry of its `models` valve.
pub struct MultiEchoPipeline;

impl Pipeline for MultiEchoPipeline {
    fn manifest(&self) -> PluginManifest {
        PluginManifest::new(PipelineKind::Manifold).with_name("Multi Echo: ")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::pipe()
    }

    fn valves_schema(&self) -> ValvesSchema {
        ValvesSchema::new("MultiEchoValves").string_list("models", &["alpha", "beta"])
    }

    fn pipelines(&self, valves: &Valves) -> Result<Vec<SubModel>, PluginError> {
        Ok(valves
            .get_str_list("models")
            .unwrap_or_default()
            .into_iter()
            .map(|model| SubModel::new(model.clone(), model))
            .collect())
    }

    fn pipe(&self, call: PipeCall) -> Result<CompletionOutcome, PluginError> {
        Ok(CompletionOutcome::Text(format!(
            "[{}] {}",
            call.model_id, call.user_message
        )))
    }
}

/// Rejects conversations longer than `max_turns` messages for the targeted
/// user roles.
pub struct TurnLimitFilter;

impl Pipeline for TurnLimitFilter {
    fn manifest(&self) -> PluginManifest {
        PluginManifest::new(PipelineKind::Filter).with_name("Conversation Turn Limit")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inlet: true,
            ..Capabilities::default()
        }
    }

    fn valves_schema(&self) -> ValvesSchema {
        ValvesSchema::new("TurnLimitValves")
            .string_list("pipelines", &["*"])
            .integer("priority", 0)
            .integer("max_turns", 8)
            .string_list("target_user_roles", &["user"])
    }

    fn inlet(
        &self,
        valves: &Valves,
        body: Value,
        user: Option<&Value>,
    ) -> Result<Value, PluginError> {
        let role = user
            .and_then(|user| user.get("role"))
            .and_then(Value::as_str)
            .unwrap_or("user");
        let targeted = valves
            .get_str_list("target_user_roles")
            .unwrap_or_default()
            .iter()
            .any(|target| target == role);
        if !targeted {
            return Ok(body);
        }

        let max_turns = valves.get_i64("max_turns").unwrap_or(8);
        let turns = body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if turns as i64 > max_turns {
            return Err(PluginError::runtime(format!(
                "Conversation turn limit exceeded. Max turns: {max_turns}"
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn call(valves: Valves, body: Value) -> PipeCall {
        PipeCall {
            user_message: "hello big world".into(),
            model_id: "echo".into(),
            messages: Vec::new(),
            body,
            valves: Arc::new(valves),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_echo_streams_words() {
        let pipeline = EchoPipeline;
        let valves = pipeline.valves_schema().defaults();
        let outcome = pipeline.pipe(call(valves, json!({"stream": true}))).unwrap();

        let CompletionOutcome::Stream(fragments) = outcome else {
            panic!("expected a stream");
        };
        let words: Vec<Fragment> = fragments.map(Result::unwrap).collect();
        assert_eq!(
            words,
            vec![
                Fragment::from("hello "),
                Fragment::from("big "),
                Fragment::from("world")
            ]
        );
    }

    #[test]
    fn test_echo_prefix_without_stream() {
        let pipeline = EchoPipeline;
        let valves = pipeline
            .valves_schema()
            .validate(&json!({"prefix": "> "}))
            .unwrap();
        let outcome = pipeline.pipe(call(valves, json!({}))).unwrap();
        assert!(matches!(outcome, CompletionOutcome::Text(t) if t == "> hello big world"));
    }

    #[test]
    fn test_multi_echo_submodels_follow_valves() {
        let pipeline = MultiEchoPipeline;
        let valves = pipeline
            .valves_schema()
            .validate(&json!({"models": ["x", "y", "z"]}))
            .unwrap();
        let ids: Vec<String> = pipeline
            .pipelines(&valves)
            .unwrap()
            .into_iter()
            .map(|model| model.id)
            .collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_turn_limit() {
        let filter = TurnLimitFilter;
        let valves = filter
            .valves_schema()
            .validate(&json!({"max_turns": 2}))
            .unwrap();

        let short = json!({"messages": [{"role": "user", "content": "a"}]});
        assert_eq!(filter.inlet(&valves, short.clone(), None).unwrap(), short);

        let long = json!({"messages": [
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"},
            {"role": "user", "content": "c"}
        ]});
        let err = filter.inlet(&valves, long.clone(), None).unwrap_err();
        assert!(err.to_string().contains("Max turns: 2"));

        let admin = json!({"role": "admin"});
        assert!(filter.inlet(&valves, long, Some(&admin)).is_ok());
    }
}
