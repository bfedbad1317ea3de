//! Agent System
//!
//! The agents behind a flight-log question:
//!
//! - **Query Classifier**: labels the message SQL, ANALYSIS or NONE
//! - **SQL Query Agent**: question → validated SQL → rows → answer
//! - **Data Analysis Agent**: extraction → sandboxed code → reasoning
//!
//! ## Pipeline Overview
//!
//! ```text
//! User Message
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Classifier  │  → SQL | ANALYSIS | NONE
//! └─────────────┘
//!      │
//!      ├──── NONE ───────────────▶ canned "not about this flight" reply
//!      │
//!      ├──── SQL ──────┐
//!      │               ▼
//!      │        ┌─────────────┐  generate → validate → execute
//!      │        │  SQL Query  │  (one regeneration) → summarize
//!      │        │   Agent     │
//!      │        └─────────────┘
//!      │
//!      └──── ANALYSIS ─┐
//!                      ▼
//!               ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!               │ Extraction  │ → │    Code     │ → │  Reasoning  │
//!               │             │   │ (sandboxed) │   │             │
//!               └─────────────┘   └─────────────┘   └─────────────┘
//! ```
//!
//! Failures caused by generated SQL or code are retried once and then become
//! a clarification. Only completion-service, table-engine and sandbox
//! availability failures leave an agent as `AppError`.

pub mod analysis;
pub mod classifier;
pub mod code_generation;
pub mod extraction;
pub mod fidelity;
pub mod prompts;
pub mod reasoning;
pub mod sql_query;

pub use analysis::DataAnalysisAgent;
pub use classifier::QueryClassifier;
pub use sql_query::SqlQueryAgent;

use crate::models::{AnalysisPlan, Category, ExchangePayload, ExecutionResult, QueryPlan, Resolution, ValidationStatus};
use crate::store::{FlightTable, TableSchema};
use crate::types::LLMMessage;

pub const NOT_RELEVANT_REPLY: &str = "I can only help with questions about the uploaded flight log, \
such as altitude, speed, battery, GPS or flight modes. Could you ask something about this flight?";

/// Everything an agent sees for one question.
pub struct AgentContext<'a> {
    pub question: &'a str,
    /// Recent conversation, oldest first.
    pub history: &'a [LLMMessage],
    pub schema: &'a TableSchema,
    pub table: &'a dyn FlightTable,
    pub flight_hint: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub enum OutcomePlan {
    Query(QueryPlan),
    Analysis(AnalysisPlan),
}

/// Resolved result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub text: String,
    pub resolution: Resolution,
    pub plan: Option<OutcomePlan>,
}

impl AgentOutcome {
    pub fn answered(text: impl Into<String>, plan: OutcomePlan) -> Self {
        Self {
            text: text.into(),
            resolution: Resolution::Answered,
            plan: Some(plan),
        }
    }

    pub fn clarification(text: impl Into<String>, plan: Option<OutcomePlan>) -> Self {
        Self {
            text: text.into(),
            resolution: Resolution::Clarification,
            plan,
        }
    }

    pub fn not_relevant() -> Self {
        Self {
            text: NOT_RELEVANT_REPLY.to_string(),
            resolution: Resolution::NotRelevant,
            plan: None,
        }
    }

    /// Audit record stored next to the assistant turn. Only SQL that passed
    /// validation is kept.
    pub fn payload(&self, category: Category) -> ExchangePayload {
        let mut payload = ExchangePayload::new(Some(category), self.resolution);
        let query = match &self.plan {
            Some(OutcomePlan::Query(plan)) => Some(plan),
            Some(OutcomePlan::Analysis(plan)) => {
                payload.code = plan.generated_code.clone();
                Some(&plan.extraction)
            }
            None => None,
        };
        if let Some(plan) = query.filter(|p| p.validation_status == ValidationStatus::Accepted) {
            payload.sql = plan.generated_sql.clone();
            if let Some(ExecutionResult::Rows { row_count, .. }) = &plan.execution_result {
                payload.row_count = Some(*row_count);
            }
        }
        payload
    }
}
