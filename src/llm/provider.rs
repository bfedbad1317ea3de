use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::LLMConfig;
use crate::types::{AppError, AppResult, LLMMessage, LLMProvider, LLMRequest, LLMResponse};

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse>;
}

/// Configuration for an LLM provider
pub struct LLMProviderConfig {
    pub name: String,
    pub api_key: String,
    pub api_base: Option<String>,
}

/// A system instruction plus the task text sent as the final user turn.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionOptions {
    /// Short, deterministic label output.
    pub const LABEL: CompletionOptions = CompletionOptions { max_tokens: 16, temperature: 0.0 };
    /// Code or SQL generation.
    pub const GENERATION: CompletionOptions = CompletionOptions { max_tokens: 1024, temperature: 0.1 };
    /// User-facing narration.
    pub const NARRATION: CompletionOptions = CompletionOptions { max_tokens: 1024, temperature: 0.3 };
}

/// Stand-in used when no API key is configured so the service can still start.
struct UnconfiguredAdapter {
    provider: String,
}

#[async_trait]
impl LLMAdapter for UnconfiguredAdapter {
    async fn create_chat_completion(&self, _request: &LLMRequest) -> AppResult<LLMResponse> {
        Err(AppError::UpstreamUnavailable(format!(
            "no API key configured for provider {}",
            self.provider
        )))
    }
}

/// The completion service: provider adapter + model + per-call timeout.
pub struct LLM {
    adapter: Arc<dyn LLMAdapter>,
    provider_name: String,
    model: String,
    timeout: Duration,
}

impl LLM {
    pub fn new(provider: LLMProviderConfig, model: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let kind = LLMProvider::from_name(&provider.name).ok_or_else(|| {
            AppError::InvalidRequest(format!("Unsupported provider: {}", provider.name))
        })?;
        let base = provider.api_base.as_deref();
        let adapter: Arc<dyn LLMAdapter> = match kind {
            LLMProvider::OpenAI => Arc::new(match base {
                Some(base) => crate::llm::openai::OpenAIAdapter::new_with_api_base(&provider.api_key, base),
                None => crate::llm::openai::OpenAIAdapter::new(&provider.api_key),
            }),
            LLMProvider::Groq => Arc::new(crate::llm::groq::GroqAdapter::new(&provider.api_key)),
            LLMProvider::OpenRouter => Arc::new(crate::llm::openrouter::OpenRouterAdapter::new(&provider.api_key)),
            LLMProvider::Anthropic => Arc::new(match base {
                Some(base) => crate::llm::anthropic::AnthropicAdapter::new_with_api_base(&provider.api_key, base),
                None => crate::llm::anthropic::AnthropicAdapter::new(&provider.api_key),
            }),
        };

        Ok(Self {
            adapter,
            provider_name: kind.to_string(),
            model: model.into(),
            timeout,
        })
    }

    pub fn from_config(config: &LLMConfig) -> AppResult<Self> {
        match config.active_api_key() {
            Some(api_key) => Self::new(
                LLMProviderConfig {
                    name: config.provider.clone(),
                    api_key,
                    api_base: config.api_base.clone(),
                },
                config.model.clone(),
                config.timeout(),
            ),
            None => {
                warn!(provider = %config.provider, "No LLM API key configured, completions will fail");
                Ok(Self::with_adapter(
                    Arc::new(UnconfiguredAdapter { provider: config.provider.clone() }),
                    config.model.clone(),
                    config.timeout(),
                ))
            }
        }
    }

    pub fn with_adapter(adapter: Arc<dyn LLMAdapter>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            adapter,
            provider_name: "custom".to_string(),
            model: model.into(),
            timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> AppResult<LLMResponse> {
        match tokio::time::timeout(self.timeout, self.adapter.create_chat_completion(request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::UpstreamTimeout(self.timeout.as_millis() as u64)),
        }
    }

    /// `complete(prompt, conversationContext, options) -> text`.
    ///
    /// The returned text is whatever the model produced.
    pub async fn complete(
        &self,
        prompt: &Prompt,
        context: &[LLMMessage],
        options: &CompletionOptions,
    ) -> AppResult<String> {
        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.extend_from_slice(context);
        messages.push(LLMMessage::user(prompt.user.clone()));

        let request = LLMRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(options.max_tokens),
            temperature: Some(options.temperature),
            system_instruction: Some(prompt.system.clone()),
        };

        let response = self.create_chat_completion(&request).await?;
        debug!(
            provider = %self.provider_name,
            finish_reason = %response.finish_reason,
            completion_tokens = response.usage.completion_tokens,
            "Completion received"
        );
        Ok(response.content.trim().to_string())
    }
}
