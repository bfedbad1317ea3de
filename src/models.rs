use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::orchestrator::AgentOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<AgentOrchestrator>,
}

// Conversation records

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One side of a conversational turn. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<ExchangePayload>,
}

impl Exchange {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp,
            payload: None,
        }
    }

    pub fn assistant(text: impl Into<String>, payload: ExchangePayload) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            payload: Some(payload),
        }
    }
}

/// How an assistant turn was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Answered,
    Clarification,
    NotRelevant,
    Error,
}

/// Structured record kept next to an assistant turn for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePayload {
    pub category: Option<Category>,
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ExchangePayload {
    pub fn new(category: Option<Category>, resolution: Resolution) -> Self {
        Self {
            category,
            resolution,
            sql: None,
            row_count: None,
            code: None,
        }
    }
}

// Classification

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Sql,
    Analysis,
    None,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Sql, Category::Analysis, Category::None];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Sql => "SQL",
            Category::Analysis => "ANALYSIS",
            Category::None => "NONE",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub rationale: Option<String>,
}

// Per-invocation plans

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub enum ExecutionResult {
    Rows { columns: Vec<String>, row_count: usize, truncated: bool },
    Error(String),
}

/// One SQL-agent invocation: question → SQL → validation → execution.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub natural_language_question: String,
    pub generated_sql: Option<String>,
    pub validation_status: ValidationStatus,
    pub execution_result: Option<ExecutionResult>,
    /// Number of times the SQL was generated (1 or 2).
    pub generations: u32,
}

impl QueryPlan {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            natural_language_question: question.into(),
            generated_sql: None,
            validation_status: ValidationStatus::Pending,
            execution_result: None,
            generations: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisPlan {
    pub extraction: QueryPlan,
    pub generated_code: Option<String>,
    pub code_execution_result: Option<String>,
    pub final_insight_text: Option<String>,
}

impl AnalysisPlan {
    pub fn new(extraction: QueryPlan) -> Self {
        Self {
            extraction,
            generated_code: None,
            code_execution_result: None,
            final_insight_text: None,
        }
    }
}

// API Request/Response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub flight_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub exchanges: Vec<Exchange>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub session_id: String,
    pub tables: Vec<String>,
    pub rows_inserted: usize,
}

/// Body of non-chat error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serialization() {
        assert_eq!(serde_json::to_string(&Category::Sql).unwrap(), "\"SQL\"");
        assert_eq!(serde_json::to_string(&Category::Analysis).unwrap(), "\"ANALYSIS\"");
        assert_eq!(Category::None.to_string(), "NONE");
    }

    #[test]
    fn test_chat_request_camel_case() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"message": "max altitude?", "sessionId": "abc", "flightData": {"mode": "AUTO"}}"#,
        )
        .unwrap();
        assert_eq!(request.session_id.as_deref(), Some("abc"));
        assert!(request.flight_data.is_some());

        let minimal: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(minimal.session_id.is_none());
    }

    #[test]
    fn test_chat_response_omits_empty_error() {
        let response = ChatResponse {
            message: "ok".to_string(),
            session_id: "abc".to_string(),
            error: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert!(json.get("error").is_none());
    }
}
