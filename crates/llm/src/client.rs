//! OpenAI-compatible chat client with three model slots.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{LlmService, ToolInvocation, ToolsResponse};

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    structured_model: String,
    reasoning_model: String,
    agent_model: String,
    /// Transport retries per request (in addition to the first attempt).
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    /// Arrives as a JSON-encoded string on OpenAI-compatible APIs.
    #[serde(default)]
    arguments: Value,
}

impl OpenRouterClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        structured_model: impl Into<String>,
        reasoning_model: impl Into<String>,
        agent_model: impl Into<String>,
        max_retries: u32,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            structured_model: structured_model.into(),
            reasoning_model: reasoning_model.into(),
            agent_model: agent_model.into(),
            max_retries,
        }
    }

    async fn complete(&self, request: &ChatRequest<'_>) -> Option<ChatCompletion> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        for attempt in 0..=self.max_retries {
            let sent = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(request)
                .send()
                .await;

            match sent {
                Ok(response) if response.status().is_success() => {
                    match response.json::<ChatCompletion>().await {
                        Ok(completion) => return Some(completion),
                        Err(err) => {
                            warn!(attempt, error = %err, "chat completion body did not parse");
                        }
                    }
                }
                Ok(response) => {
                    warn!(
                        attempt,
                        status = %response.status(),
                        model = request.model,
                        "chat completion returned non-success status"
                    );
                }
                Err(err) => {
                    warn!(attempt, error = %err, model = request.model, "chat completion request failed");
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
            }
        }

        error!(model = request.model, "chat completion exhausted retries");
        None
    }

    fn messages<'a>(system: &'a str, user: &'a str) -> Vec<RequestMessage<'a>> {
        vec![
            RequestMessage {
                role: "system",
                content: system,
            },
            RequestMessage {
                role: "user",
                content: user,
            },
        ]
    }
}

#[async_trait]
impl LlmService for OpenRouterClient {
    async fn call_structured(&self, system: &str, user: &str) -> Option<Value> {
        let request = ChatRequest {
            model: &self.structured_model,
            messages: Self::messages(system, user),
            temperature: 0.0,
            response_format: Some(serde_json::json!({"type": "json_object"})),
            tools: None,
            tool_choice: None,
        };

        let completion = self.complete(&request).await?;
        let content = completion.choices.into_iter().next()?.message.content?;
        debug!(len = content.len(), "structured completion received");

        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "structured completion was not valid JSON");
                None
            }
        }
    }

    async fn call_reasoning(&self, system: &str, user: &str) -> Option<String> {
        let request = ChatRequest {
            model: &self.reasoning_model,
            messages: Self::messages(system, user),
            temperature: 1.0,
            response_format: None,
            tools: None,
            tool_choice: None,
        };

        let completion = self.complete(&request).await?;
        let content = completion.choices.into_iter().next()?.message.content?;
        debug!(len = content.len(), "reasoning completion received");
        Some(content)
    }

    async fn call_with_tools(
        &self,
        system: &str,
        user: &str,
        tools: &Value,
    ) -> Option<ToolsResponse> {
        let request = ChatRequest {
            model: &self.agent_model,
            messages: Self::messages(system, user),
            temperature: 0.0,
            response_format: None,
            tools: Some(tools),
            tool_choice: Some("required"),
        };

        let completion = self.complete(&request).await?;
        let message = completion.choices.into_iter().next()?.message;

        let tool_calls = message
            .tool_calls
            .into_iter()
            .map(|raw| {
                // Arguments arrive as either a JSON string or an object,
                // depending on the provider. Normalize to an object.
                let arguments = match &raw.function.arguments {
                    Value::String(s) => {
                        serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
                    }
                    other => other.clone(),
                };
                ToolInvocation {
                    name: raw.function.name,
                    arguments,
                }
            })
            .collect();

        Some(ToolsResponse {
            content: message.content,
            tool_calls,
        })
    }
}
