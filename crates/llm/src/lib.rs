//! LLM service surface.
//!
//! Three call shapes, mirroring how the pipeline consumes models:
//! *structured* (JSON parsed into a typed record), *reasoning* (free text
//! the caller parses), and *tools* (the model must pick exactly one tool).
//!
//! Every method degrades to `None` on failure — transport errors, empty
//! completions, malformed JSON — so callers decide whether a missing result
//! dead-letters a batch or just skips a refinement.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

mod client;
pub use client::OpenRouterClient;

/// Structured-parse retries before a typed call gives up.
pub const DEFAULT_PARSE_RETRIES: u32 = 2;

/// A tool invocation chosen by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    /// Arguments as a parsed JSON object.
    pub arguments: Value,
}

/// Response from a tool-choice call.
#[derive(Debug, Clone, Default)]
pub struct ToolsResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
}

/// The three call shapes the core depends on.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// JSON-mode completion. Returns the parsed JSON value, or `None`.
    async fn call_structured(&self, system: &str, user: &str) -> Option<Value>;

    /// Free-form completion. Returns raw text, or `None`.
    async fn call_reasoning(&self, system: &str, user: &str) -> Option<String>;

    /// Tool-choice completion (`tool_choice: required`). Returns content plus
    /// the chosen tool calls, or `None`.
    async fn call_with_tools(&self, system: &str, user: &str, tools: &Value)
        -> Option<ToolsResponse>;
}

/// Run a structured call and parse the result into `T`, retrying the whole
/// call when the model returns JSON that doesn't fit the record.
pub async fn call_typed<T: DeserializeOwned>(
    llm: &dyn LlmService,
    system: &str,
    user: &str,
) -> Option<T> {
    for attempt in 0..=DEFAULT_PARSE_RETRIES {
        let Some(value) = llm.call_structured(system, user).await else {
            // Transport-level failure; the client already retried internally.
            return None;
        };

        match serde_json::from_value::<T>(value) {
            Ok(parsed) => return Some(parsed),
            Err(err) => {
                warn!(attempt, error = %err, "structured response did not match schema");
            }
        }
    }

    error!(
        retries = DEFAULT_PARSE_RETRIES,
        "structured call exhausted parse retries"
    );
    None
}

/// Pull a named string argument out of a tool invocation.
pub fn arg_str(call: &ToolInvocation, key: &str) -> String {
    call.arguments
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Pull a named integer argument, falling back to `default`.
pub fn arg_i64(call: &ToolInvocation, key: &str, default: i64) -> i64 {
    call.arguments
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

/// Canonical form of a call's arguments for duplicate suppression:
/// keys sorted, values rendered compactly.
pub fn canonical_args(arguments: &Value) -> String {
    match arguments.as_object() {
        Some(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}={}", map[k]))
                .collect();
            parts.join(",")
        }
        None => arguments.to_string(),
    }
}

impl ToolsResponse {
    /// The single tool call, when the model obeyed `tool_choice: required`
    /// with exactly one selection.
    pub fn single_call(&self) -> Option<&ToolInvocation> {
        if self.tool_calls.len() == 1 {
            self.tool_calls.first()
        } else {
            None
        }
    }
}

/// A scripted LLM for tests: pops pre-canned responses in order.
///
/// Lives here rather than under `#[cfg(test)]` because every downstream
/// crate's tests drive their pipelines with it.
pub mod fake {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeLlm {
        structured: Mutex<VecDeque<Option<Value>>>,
        reasoning: Mutex<VecDeque<Option<String>>>,
        tools: Mutex<VecDeque<Option<ToolsResponse>>>,
        pub structured_calls: std::sync::atomic::AtomicUsize,
        pub reasoning_calls: std::sync::atomic::AtomicUsize,
        pub tool_calls: std::sync::atomic::AtomicUsize,
    }

    impl FakeLlm {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_structured(&self, value: Option<Value>) {
            self.structured.lock().unwrap().push_back(value);
        }

        pub fn push_reasoning(&self, text: Option<&str>) {
            self.reasoning
                .lock()
                .unwrap()
                .push_back(text.map(str::to_string));
        }

        pub fn push_tools(&self, response: Option<ToolsResponse>) {
            self.tools.lock().unwrap().push_back(response);
        }

        pub fn push_tool_call(&self, name: &str, arguments: Value) {
            self.push_tools(Some(ToolsResponse {
                content: None,
                tool_calls: vec![ToolInvocation {
                    name: name.to_string(),
                    arguments,
                }],
            }));
        }
    }

    #[async_trait]
    impl LlmService for FakeLlm {
        async fn call_structured(&self, _system: &str, _user: &str) -> Option<Value> {
            self.structured_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.structured.lock().unwrap().pop_front().flatten()
        }

        async fn call_reasoning(&self, _system: &str, _user: &str) -> Option<String> {
            self.reasoning_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.reasoning.lock().unwrap().pop_front().flatten()
        }

        async fn call_with_tools(
            &self,
            _system: &str,
            _user: &str,
            _tools: &Value,
        ) -> Option<ToolsResponse> {
            self.tool_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.tools.lock().unwrap().pop_front().flatten()
        }
    }

}

#[cfg(test)]
mod tests {
    use super::fake::FakeLlm;
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Probe {
        name: String,
    }

    #[tokio::test]
    async fn call_typed_parses_matching_json() {
        let llm = FakeLlm::new();
        llm.push_structured(Some(json!({"name": "Priya"})));

        let parsed: Option<Probe> = call_typed(&llm, "sys", "user").await;
        assert_eq!(parsed.unwrap().name, "Priya");
    }

    #[tokio::test]
    async fn call_typed_retries_on_schema_mismatch() {
        let llm = FakeLlm::new();
        llm.push_structured(Some(json!({"wrong": 1})));
        llm.push_structured(Some(json!({"name": "Marcus"})));

        let parsed: Option<Probe> = call_typed(&llm, "sys", "user").await;
        assert_eq!(parsed.unwrap().name, "Marcus");
        assert_eq!(
            llm.structured_calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn call_typed_gives_up_on_transport_failure() {
        let llm = FakeLlm::new();
        llm.push_structured(None);

        let parsed: Option<Probe> = call_typed(&llm, "sys", "user").await;
        assert!(parsed.is_none());
    }

    #[test]
    fn canonical_args_sorts_keys() {
        let args = json!({"b": 2, "a": "x"});
        assert_eq!(canonical_args(&args), "a=\"x\",b=2");
    }

    #[test]
    fn single_call_requires_exactly_one() {
        let mut resp = ToolsResponse::default();
        assert!(resp.single_call().is_none());
        resp.tool_calls.push(ToolInvocation {
            name: "finish".into(),
            arguments: json!({}),
        });
        assert_eq!(resp.single_call().unwrap().name, "finish");
    }
}
