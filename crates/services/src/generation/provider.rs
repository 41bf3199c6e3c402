use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::{ConfigError, GenerationError};

/// Token accounting reported by the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    /// Prompt tokens served from the provider's prompt cache.
    pub cached_tokens: Option<u32>,
}

impl TokenUsage {
    #[must_use]
    pub fn cache_hit(&self) -> bool {
        self.cached_tokens.is_some_and(|cached| cached > 0)
    }
}

/// One chat request: the stable system prefix plus the batch message.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub system: String,
    pub user: String,
}

#[derive(Clone, Debug)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// An LLM backend able to answer a batch prompt with question JSON.
#[async_trait]
pub trait QuestionProvider: Send + Sync {
    /// Provider name used for logging and pricing.
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    /// Send one request.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError` when the request fails or the response is empty.
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, GenerationError>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: ProviderConfig,
    api_key: String,
}

impl OpenAiCompatibleProvider {
    /// # Errors
    ///
    /// Returns `ConfigError::MissingApiKey` when no API key is configured.
    pub fn new(config: ProviderConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;
        Ok(Self {
            client: Client::new(),
            config,
            api_key,
        })
    }
}

#[async_trait]
impl QuestionProvider for OpenAiCompatibleProvider {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, GenerationError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: 0.7,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GenerationError::HttpStatus(response.status()));
        }

        let body: ChatResponse = response.json().await?;
        let usage = body.usage.map(TokenUsage::from).unwrap_or_default();
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        Ok(ProviderResponse { content, usage })
    }
}

/// Stand-in used when no API key is configured; every request fails.
#[derive(Clone, Debug, Default)]
pub struct DisabledProvider;

#[async_trait]
impl QuestionProvider for DisabledProvider {
    fn provider(&self) -> &str {
        "disabled"
    }

    fn model(&self) -> &str {
        "none"
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u32>,
}

impl From<ChatUsage> for TokenUsage {
    fn from(usage: ChatUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: usage
                .prompt_tokens_details
                .and_then(|details| details.cached_tokens),
        }
    }
}
