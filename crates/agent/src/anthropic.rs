//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{ChatMessage, ChatProvider, ChatResponse, ContentBlock, ToolSchema};

const API_VERSION: &str = "2023-06-01";

/// Configuration for the Anthropic provider.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    /// Messages endpoint, e.g. `https://api.anthropic.com/v1/messages`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    /// Sampling temperature; scoring calls pin this to 0.
    pub temperature: f64,
    pub timeout: Duration,
}

impl AnthropicConfig {
    /// Defaults: 120 s timeout, 4096 max tokens, temperature 0.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

fn no_tools(tools: &&[ToolSchema]) -> bool {
    tools.is_empty()
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSchema],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// HTTP client for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn respond(
        &self,
        system: &str,
        tools: &[ToolSchema],
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, ProviderError> {
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            system,
            messages,
            tools,
        };

        debug!(model = %self.config.model, messages = messages.len(), "sending messages request");

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?;
            return Ok(ChatResponse {
                content: parsed.content,
                stop_reason: parsed.stop_reason,
            });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, "provider returned error");
        // Throttling and server-side failures are transient; the session
        // loop's bounded retry handles them. Everything else is terminal.
        if status.as_u16() == 429 || status.is_server_error() {
            Err(ProviderError::Transport(format!("HTTP {status}: {body}")))
        } else {
            Err(ProviderError::Api(format!("HTTP {status}: {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_wire_shape() {
        let config = AnthropicConfig::new("http://localhost/v1/messages", "key", "claude-test");
        let messages = vec![ChatMessage::user_text("hi")];
        let tools = vec![ToolSchema {
            name: "shell".into(),
            description: "run a command".into(),
            input_schema: json!({"type": "object"}),
        }];
        let request = MessagesRequest {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system: "be brief",
            messages: &messages,
            tools: &tools,
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["model"], "claude-test");
        assert_eq!(wire["system"], "be brief");
        assert_eq!(wire["messages"][0]["role"], "user");
        assert_eq!(wire["messages"][0]["content"][0]["type"], "text");
        assert_eq!(wire["tools"][0]["name"], "shell");
    }

    #[test]
    fn empty_system_and_tools_are_omitted() {
        let request = MessagesRequest {
            model: "m",
            max_tokens: 16,
            temperature: 0.0,
            system: "",
            messages: &[],
            tools: &[],
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert!(wire.get("system").is_none());
        assert!(wire.get("tools").is_none());
    }

    #[test]
    fn response_parses_tool_use_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "toolu_1", "name": "shell",
                 "input": {"command": "docker ps", "reasoning": "list containers"}}
            ],
            "stop_reason": "tool_use"
        });
        let parsed: MessagesResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.stop_reason.as_deref(), Some("tool_use"));
    }
}
