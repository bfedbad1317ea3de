// Type definitions and enums

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LLMProvider {
    OpenAI,
    Groq,
    OpenRouter,
    Anthropic,
}

impl LLMProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(LLMProvider::OpenAI),
            "groq" => Some(LLMProvider::Groq),
            "openrouter" => Some(LLMProvider::OpenRouter),
            "anthropic" => Some(LLMProvider::Anthropic),
            _ => None,
        }
    }
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LLMProvider::OpenAI => write!(f, "openai"),
            LLMProvider::Groq => write!(f, "groq"),
            LLMProvider::OpenRouter => write!(f, "openrouter"),
            LLMProvider::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LLMRequest {
    pub model: String,
    pub messages: Vec<LLMMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LLMMessage {
    pub role: String, // "user", "assistant", "system"
    pub content: String,
}

impl LLMMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Errors that leave an agent. Recoverable agent-internal failures (ambiguous
/// classification, rejected SQL, failed executions) never become an `AppError`;
/// they are turned into NONE or clarification outcomes where they happen.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Completion service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Completion service timed out after {0}ms")]
    UpstreamTimeout(u64),

    #[error("Session is busy: {0}")]
    SessionBusy(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session capacity reached ({0} active)")]
    CapacityReached(usize),

    #[error("Table engine error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code reported in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::UpstreamTimeout(_) => "upstream_timeout",
            AppError::SessionBusy(_) => "session_busy",
            AppError::SessionNotFound(_) => "session_not_found",
            AppError::CapacityReached(_) => "capacity_reached",
            AppError::Store(StoreError::InvalidData(_)) => "invalid_flight_data",
            AppError::Store(_) => "table_engine_unavailable",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Internal(_) => "internal_error",
        }
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_name() {
        assert_eq!(LLMProvider::from_name("OpenAI"), Some(LLMProvider::OpenAI));
        assert_eq!(LLMProvider::from_name(" groq "), Some(LLMProvider::Groq));
        assert_eq!(LLMProvider::from_name("glm"), None);
        assert_eq!(LLMProvider::Anthropic.to_string(), "anthropic");
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(AppError::UpstreamTimeout(10).code(), "upstream_timeout");
        assert_eq!(AppError::SessionBusy("s".into()).code(), "session_busy");
        assert_eq!(
            AppError::Store(StoreError::InvalidData("no messages".into())).code(),
            "invalid_flight_data"
        );
        assert_eq!(AppError::Store(StoreError::Unavailable("closed".into())).code(), "table_engine_unavailable");
    }
}
