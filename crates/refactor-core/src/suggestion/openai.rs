//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{build_prompt, SuggestionGenerator, SuggestionRequest, SYSTEM_PROMPT};
use crate::domain::{BotError, Result};
use crate::retry::{status_error, transport_error};

const SERVICE: &str = "openai";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - OPENAI_API_KEY (required)
    /// - OPENAI_BASE_URL (optional, default: "https://api.openai.com/v1")
    /// - REFACTOR_BOT_MODEL (optional, default: "gpt-4o-mini")
    /// - REFACTOR_BOT_TEMPERATURE (optional, default: 0.7)
    /// - REFACTOR_BOT_MAX_TOKENS (optional, default: 2000)
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| BotError::FatalConfig("OPENAI_API_KEY not set".to_string()))?;
        let mut config = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("REFACTOR_BOT_MODEL") {
            config.model = model;
        }
        if let Ok(raw) = std::env::var("REFACTOR_BOT_TEMPERATURE") {
            config.temperature = raw.trim().parse().map_err(|_| {
                BotError::FatalConfig(format!("REFACTOR_BOT_TEMPERATURE is not a number: {raw}"))
            })?;
        }
        if let Ok(raw) = std::env::var("REFACTOR_BOT_MAX_TOKENS") {
            config.max_tokens = raw.trim().parse().map_err(|_| {
                BotError::FatalConfig(format!("REFACTOR_BOT_MAX_TOKENS is not an integer: {raw}"))
            })?;
        }
        Ok(config)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice's message content.
fn extract_content(body: &str) -> Result<String> {
    let response: ChatResponse = serde_json::from_str(body)?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BotError::External {
            service: SERVICE.to_string(),
            status: 200,
            message: "response contained no message content".to_string(),
        })
}

#[derive(Clone)]
pub struct OpenAiGenerator {
    config: OpenAiConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiGenerator {
    /// `timeout` bounds each completion request.
    pub fn new(config: OpenAiConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("refactor-bot/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| BotError::FatalConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn from_env(timeout: Duration) -> Result<Self> {
        Self::new(OpenAiConfig::from_env()?, timeout)
    }
}

#[async_trait]
impl SuggestionGenerator for OpenAiGenerator {
    #[instrument(skip(self, request), fields(file = %request.file_path, tier = request.tier.rank()))]
    async fn generate(&self, request: &SuggestionRequest) -> Result<String> {
        let prompt = build_prompt(request);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let response = self
            .http
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        if !status.is_success() {
            return Err(status_error(SERVICE, status, &text));
        }

        let content = extract_content(&text)?;
        debug!(chars = content.len(), "suggestion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_joins_cleanly() {
        let mut cfg = OpenAiConfig::new("k");
        assert_eq!(cfg.completions_url(), "https://api.openai.com/v1/chat/completions");
        cfg.base_url = "http://localhost:8080/v1/".to_string();
        assert_eq!(cfg.completions_url(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_request_serialization() {
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT,
            }],
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["max_tokens"], 2000);
        assert_eq!(value["messages"][0]["role"], "system");
    }

    #[test]
    fn test_extract_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"x = 1\n"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "x = 1\n");
    }

    #[test]
    fn test_extract_without_choices_fails() {
        assert!(extract_content(r#"{"choices":[]}"#).is_err());
        assert!(extract_content("not json").is_err());
    }
}
