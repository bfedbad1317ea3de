//! SQL Query Agent
//!
//! GENERATE → VALIDATE → EXECUTE → SUMMARIZE, with one regeneration shared by
//! validation rejections and recoverable engine errors. When the budget runs
//! out the agent asks the user to rephrase instead of failing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agents::{fidelity, prompts, AgentContext, AgentOutcome, OutcomePlan};
use crate::config::AgentConfig;
use crate::llm::{CompletionOptions, Prompt, LLM};
use crate::models::{ExecutionResult, QueryPlan, ValidationStatus};
use crate::store::{QueryLimits, QueryResult};
use crate::types::AppResult;
use crate::utils::RegenerationBudget;
use crate::validator;

pub const NO_DATA_CLARIFICATION: &str =
    "There is no flight log loaded for this session yet. Upload a flight log and ask again.";

pub const REJECTED_CLARIFICATION: &str = "I couldn't turn that into a query over this flight's data. \
Could you rephrase the question and name the parameter you're interested in, for example altitude, \
battery voltage, speed or GPS position?";

pub const NO_ROWS_ANSWER: &str = "No matching records were found in this flight log for that question.";

const CLARIFICATION_OPTIONS: CompletionOptions = CompletionOptions { max_tokens: 100, temperature: 0.3 };

/// What the generated statement is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTask {
    /// Rows that directly answer the question.
    Answer,
    /// Raw rows for a downstream analysis step.
    Extract,
}

impl FetchTask {
    fn stage(&self) -> &'static str {
        match self {
            FetchTask::Answer => "sql",
            FetchTask::Extract => "extraction",
        }
    }
}

/// Terminal state of GENERATE + VALIDATE + EXECUTE.
#[derive(Debug)]
pub enum Fetch {
    Rows { plan: QueryPlan, result: QueryResult },
    Rejected { plan: QueryPlan, clarification: String },
}

pub struct SqlQueryAgent {
    llm: Arc<LLM>,
    limits: QueryLimits,
    config: AgentConfig,
}

impl SqlQueryAgent {
    pub fn new(llm: Arc<LLM>, limits: QueryLimits, config: AgentConfig) -> Self {
        Self { llm, limits, config }
    }

    /// `answer(question, context, schema) -> {text, plan}`.
    pub async fn answer(&self, ctx: &AgentContext<'_>) -> AppResult<AgentOutcome> {
        info!(question_len = ctx.question.len(), "SQL agent started");

        if self.config.clarification_check && !ctx.schema.is_empty() {
            if let Some(question) = self.needs_clarification(ctx).await {
                info!("Question needs clarification before querying");
                let plan = OutcomePlan::Query(QueryPlan::new(ctx.question));
                return Ok(AgentOutcome::clarification(question, Some(plan)));
            }
        }

        match self.fetch(ctx, FetchTask::Answer).await? {
            Fetch::Rejected { plan, clarification } => {
                Ok(AgentOutcome::clarification(clarification, Some(OutcomePlan::Query(plan))))
            }
            Fetch::Rows { plan, result } if result.is_empty() => {
                info!("Query returned no rows");
                Ok(AgentOutcome::answered(NO_ROWS_ANSWER, OutcomePlan::Query(plan)))
            }
            Fetch::Rows { plan, result } => {
                let text = self.summarize(ctx, &plan, &result).await?;
                info!(row_count = result.row_count(), "SQL agent answered");
                Ok(AgentOutcome::answered(text, OutcomePlan::Query(plan)))
            }
        }
    }

    /// Generate, validate and execute a statement for `task`.
    ///
    /// Only completion-service and engine-availability failures are errors;
    /// everything attributable to the generated SQL ends in
    /// [`Fetch::Rejected`] once the regeneration budget is spent.
    pub async fn fetch(&self, ctx: &AgentContext<'_>, task: FetchTask) -> AppResult<Fetch> {
        let mut plan = QueryPlan::new(ctx.question);
        if ctx.schema.is_empty() {
            debug!("No tables loaded, skipping generation");
            return Ok(Fetch::Rejected {
                plan,
                clarification: NO_DATA_CLARIFICATION.to_string(),
            });
        }

        let mut budget = RegenerationBudget::new(task.stage());
        let mut feedback: Option<String> = None;

        while budget.begin() {
            let prompt = Self::create_sql_prompt(ctx, task, feedback.as_deref());
            let raw = self.llm.complete(&prompt, ctx.history, &CompletionOptions::GENERATION).await?;
            let sql = prompts::extract_code_block(&raw, "sql");

            plan.generations = budget.generations();
            plan.generated_sql = Some(sql.clone());
            plan.execution_result = None;

            let query = match validator::validate(&sql, ctx.schema) {
                Ok(query) => {
                    plan.validation_status = ValidationStatus::Accepted;
                    query
                }
                Err(err) => {
                    plan.validation_status = ValidationStatus::Rejected;
                    warn!(stage = task.stage(), attempt = budget.generations(), error = %err, sql = %sql, "Generated SQL rejected");
                    feedback = Some(format!(
                        "Your previous statement was rejected: {err}. Write a single read-only SELECT over the listed tables and columns only."
                    ));
                    continue;
                }
            };

            debug!(sql = %query, "Executing validated query");
            match ctx.table.execute(&query, &self.limits).await {
                Ok(result) => {
                    plan.execution_result = Some(ExecutionResult::Rows {
                        columns: result.columns.clone(),
                        row_count: result.row_count(),
                        truncated: result.truncated,
                    });
                    return Ok(Fetch::Rows { plan, result });
                }
                Err(err) if err.is_recoverable() => {
                    warn!(stage = task.stage(), attempt = budget.generations(), error = %err, sql = %query, "Query execution failed");
                    plan.execution_result = Some(ExecutionResult::Error(err.to_string()));
                    feedback = Some(format!(
                        "Your previous statement failed when executed: {err}. Fix it using only the listed tables and columns."
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!(stage = task.stage(), generations = plan.generations, "Regeneration budget spent, asking for clarification");
        Ok(Fetch::Rejected {
            plan,
            clarification: REJECTED_CLARIFICATION.to_string(),
        })
    }

    /// `Some(question)` when the completion service thinks the question is
    /// too vague to query. Failures of the check are logged and ignored.
    async fn needs_clarification(&self, ctx: &AgentContext<'_>) -> Option<String> {
        let prompt = Prompt::new(
            prompts::CLARIFICATION_SYSTEM,
            format!(
                "Tables:\n{}\nQuestion: {}\n\nDoes this question need clarification? If yes, what specific question should I ask the user?",
                ctx.schema.render(),
                ctx.question
            ),
        );
        match self.llm.complete(&prompt, ctx.history, &CLARIFICATION_OPTIONS).await {
            Ok(reply) if is_no_clarification(&reply) => None,
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(error = %err, "Clarification check failed, continuing");
                None
            }
        }
    }

    async fn summarize(&self, ctx: &AgentContext<'_>, plan: &QueryPlan, result: &QueryResult) -> AppResult<String> {
        let rows = result.to_compact_json(self.config.prompt_max_rows);
        let prompt = Prompt::new(
            prompts::SUMMARY_SYSTEM,
            prompts::with_flight_hint(
                format!(
                    "Table descriptions:\n{}\nOriginal question: {}\nSQL: {}\nQuery results: {}",
                    ctx.schema.render(),
                    ctx.question,
                    plan.generated_sql.as_deref().unwrap_or_default(),
                    rows
                ),
                ctx.flight_hint,
            ),
        );
        let narration = self.llm.complete(&prompt, ctx.history, &CompletionOptions::NARRATION).await?;
        Ok(fidelity::enforce(
            "sql_summary",
            narration,
            &[rows.as_str(), ctx.question],
            &render_rows(result, self.config.prompt_max_rows),
        ))
    }

    fn create_sql_prompt(ctx: &AgentContext<'_>, task: FetchTask, feedback: Option<&str>) -> Prompt {
        let mut user = format!("Database schema:\n{}\nQuestion: {}", ctx.schema.render(), ctx.question);
        if task == FetchTask::Extract {
            user.push_str("\n\n");
            user.push_str(prompts::EXTRACTION_GUIDELINES);
        }
        if let Some(feedback) = feedback {
            user.push_str("\n\n");
            user.push_str(feedback);
        }
        Prompt::new(prompts::SQL_SYSTEM, prompts::with_flight_hint(user, ctx.flight_hint))
    }
}

fn is_no_clarification(reply: &str) -> bool {
    let normalized = reply
        .trim()
        .trim_matches(|c: char| c == '.' || c == '"' || c == '\'' || c == '`')
        .to_lowercase();
    normalized.is_empty()
        || normalized.starts_with("null")
        || normalized == "none"
        || normalized == "no clarification needed"
}

/// Plain-text rows for appending to an answer.
fn render_rows(result: &QueryResult, max_rows: usize) -> String {
    let mut lines = vec![result.columns.join(" | ")];
    lines.extend(result.rows.iter().take(max_rows).map(|row| {
        row.iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }));
    if result.truncated || result.rows.len() > max_rows {
        lines.push(format!("({} rows shown)", result.rows.len().min(max_rows)));
    }
    lines.join("\n")
}
