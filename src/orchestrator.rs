//! Agent Orchestrator
//!
//! Owns the session lifecycle for one request: lock the session, classify,
//! dispatch to the matching agent and record exactly one user/assistant pair.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info};

use crate::agents::{prompts, AgentContext, AgentOutcome, DataAnalysisAgent, QueryClassifier, SqlQueryAgent};
use crate::config::{AgentConfig, Config};
use crate::llm::LLM;
use crate::models::{Category, ChatResponse, Exchange, ExchangePayload, Resolution};
use crate::sandbox::{CodeSandbox, SandboxLimits};
use crate::session::SessionStore;
use crate::store::{FlightTable, QueryLimits};
use crate::types::{AppError, AppResult, LLMMessage};

pub const GENERIC_ERROR_REPLY: &str =
    "Sorry, something went wrong while processing your question. Please try again in a moment.";

pub struct AgentOrchestrator {
    config: AgentConfig,
    classifier: QueryClassifier,
    sql: Arc<SqlQueryAgent>,
    analysis: DataAnalysisAgent,
    sessions: Arc<SessionStore>,
}

impl AgentOrchestrator {
    pub fn new(config: &Config, llm: Arc<LLM>, sandbox: Arc<dyn CodeSandbox>, sessions: Arc<SessionStore>) -> Self {
        let sql = Arc::new(SqlQueryAgent::new(
            llm.clone(),
            QueryLimits::from(&config.store),
            config.agent.clone(),
        ));
        let analysis = DataAnalysisAgent::new(
            llm.clone(),
            sql.clone(),
            sandbox,
            SandboxLimits::from(&config.sandbox),
            config.agent.sample_rows,
        );
        Self {
            config: config.agent.clone(),
            classifier: QueryClassifier::new(llm),
            sql,
            analysis,
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// `handle(message, sessionId?) -> {message, sessionId, error?}`.
    ///
    /// Session errors and an empty message are returned as `Err`; every other
    /// failure is folded into a normal response with `error` set.
    pub async fn handle(
        &self,
        message: &str,
        session_id: Option<&str>,
        flight_data: Option<&Value>,
    ) -> AppResult<ChatResponse> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AppError::InvalidRequest("message must not be empty".to_string()));
        }

        let mut session = self.sessions.acquire(session_id).await?;
        let received_at = Utc::now();
        let history = prompts::render_context(session.recent(self.config.history_window));
        let flight_hint = flight_data.and_then(prompts::render_flight_hint);
        let store = session.store().clone();

        info!(
            session_id = %session.id,
            history_len = history.len(),
            message_len = message.len(),
            "Handling message"
        );

        let classified = self.classifier.classify(message, &history, flight_hint.as_deref()).await;
        let category = classified.as_ref().ok().map(|c| c.category);
        let outcome = match classified {
            Ok(result) => {
                self.route(result.category, message, &history, flight_hint.as_deref(), store.as_ref())
                    .await
            }
            Err(err) => Err(err),
        };

        let (text, payload, error_code) = match outcome {
            Ok(outcome) => {
                let category = category.unwrap_or(Category::None);
                info!(
                    session_id = %session.id,
                    category = %category,
                    resolution = ?outcome.resolution,
                    "Message resolved"
                );
                let payload = outcome.payload(category);
                (outcome.text, payload, None)
            }
            Err(err) => {
                error!(session_id = %session.id, category = ?category, error = %err, "Pipeline failed");
                (
                    GENERIC_ERROR_REPLY.to_string(),
                    ExchangePayload::new(category, Resolution::Error),
                    Some(err.code().to_string()),
                )
            }
        };

        session.append_pair(
            Exchange::user(message, received_at),
            Exchange::assistant(text.clone(), payload),
        );

        Ok(ChatResponse {
            message: text,
            session_id: session.id.clone(),
            error: error_code,
        })
    }

    /// Dispatch on the closed set of categories. NONE never touches the table.
    async fn route(
        &self,
        category: Category,
        question: &str,
        history: &[LLMMessage],
        flight_hint: Option<&str>,
        table: &dyn FlightTable,
    ) -> AppResult<AgentOutcome> {
        if category == Category::None {
            return Ok(AgentOutcome::not_relevant());
        }

        let schema = table.describe().await?;
        let ctx = AgentContext {
            question,
            history,
            schema: &schema,
            table,
            flight_hint,
        };
        match category {
            Category::Sql => self.sql.answer(&ctx).await,
            Category::Analysis => self.analysis.analyze(&ctx).await,
            Category::None => Ok(AgentOutcome::not_relevant()),
        }
    }
}
