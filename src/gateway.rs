use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AppConfig;
use crate::roles::RoleProfile;

pub const NOT_CONFIGURED: &str = "AI API not configured";

/// Timeout for full generation calls.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for lightweight classification calls.
pub const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Endpoint settings for one call, resolved once from the override chain:
/// role field -> role metadata -> global config -> hard default.
#[derive(Debug, Clone)]
pub struct AiSettings {
    pub model: String,
    pub api_url: String,
    pub api_key: String,
    pub temperature: f32,
}

impl AiSettings {
    pub fn resolve(role: Option<&RoleProfile>, config: &AppConfig) -> Self {
        let model = role
            .and_then(|r| r.ai_model.clone().filter(|v| !v.is_empty()))
            .or_else(|| role.and_then(|r| r.metadata_str("ai_model").map(str::to_string)))
            .unwrap_or_else(|| config.ai_model.clone());
        let api_url = role
            .and_then(|r| r.ai_api_url.clone().filter(|v| !v.is_empty()))
            .or_else(|| role.and_then(|r| r.metadata_str("ai_api_url").map(str::to_string)))
            .unwrap_or_else(|| config.ai_api_url.clone());
        let api_key = role
            .and_then(|r| r.ai_api_key.clone().filter(|v| !v.is_empty()))
            .or_else(|| role.and_then(|r| r.metadata_str("ai_api_key").map(str::to_string)))
            .or_else(|| config.ai_api_key.clone())
            .unwrap_or_default();
        let temperature = role
            .and_then(|r| r.ai_temperature)
            .or_else(|| {
                role.and_then(|r| r.metadata_str("ai_temperature"))
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(config.ai_temperature);

        Self {
            model,
            api_url,
            api_key,
            temperature,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.model.is_empty() && !self.api_url.is_empty() && !self.api_key.is_empty()
    }
}

/// One outbound chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub settings: AiSettings,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn generation(settings: AiSettings, messages: Vec<Message>) -> Self {
        let temperature = settings.temperature;
        Self {
            messages,
            settings,
            temperature,
            max_tokens: 1000,
            timeout: GENERATION_TIMEOUT,
        }
    }

    pub fn classification(settings: AiSettings, messages: Vec<Message>) -> Self {
        Self {
            messages,
            settings,
            temperature: 0.1,
            max_tokens: 100,
            timeout: CLASSIFY_TIMEOUT,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Uniform success/error shape for AI calls. Transport failures are folded
/// into `error` rather than raised; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl ChatOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ChatOutcome;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

/// Normalize a provider base URL so `{base}/chat/completions` is valid:
/// strips trailing slashes and an already-present completions path, then
/// appends `/v1` unless the base carries it.
pub fn normalize_api_url(raw: &str) -> String {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = base.strip_suffix("/chat/completions") {
        base = stripped.trim_end_matches('/').to_string();
    }
    if !base.ends_with("/v1") {
        base.push_str("/v1");
    }
    base
}

/// Reqwest-backed gateway speaking the OpenAI chat-completions format.
#[derive(Clone)]
pub struct AiGateway {
    client: reqwest::Client,
}

impl AiGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AiGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for AiGateway {
    async fn chat(&self, request: ChatRequest) -> ChatOutcome {
        if !request.settings.is_configured() {
            return ChatOutcome::failure(NOT_CONFIGURED);
        }

        let url = format!(
            "{}/chat/completions",
            normalize_api_url(&request.settings.api_url)
        );
        let body = ChatCompletionRequest {
            model: request.settings.model.clone(),
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = match self
            .client
            .post(&url)
            .timeout(request.timeout)
            .header(
                "Authorization",
                format!("Bearer {}", request.settings.api_key),
            )
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => return ChatOutcome::failure(format!("HTTP error: {}", error)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return ChatOutcome::failure(format!("AI API returned {}: {}", status, detail));
        }

        let completion: ChatCompletionResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(error) => {
                return ChatOutcome::failure(format!("Failed to parse AI response: {}", error))
            }
        };

        if let Some(usage) = &completion.usage {
            tracing::debug!(
                "AI usage for {}: prompt={:?} completion={:?} total={:?}",
                body.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens
            );
        }

        match completion.choices.first() {
            Some(choice) => ChatOutcome::ok(choice.message.content.clone()),
            None => ChatOutcome::failure("No response from model"),
        }
    }
}
