//! Code Generation Sub-agent
//!
//! Writes analysis code against the extracted dataset and runs it in the
//! sandbox. A failed run (timeout, exception, disallowed operation, no
//! output) is fed back into one regeneration; a second failure ends the
//! chain with a clarification.

use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::{prompts, AgentContext};
use crate::dataset::Dataset;
use crate::llm::{CompletionOptions, Prompt, LLM};
use crate::sandbox::{CodeSandbox, SandboxError, SandboxLimits, SandboxOutput};
use crate::types::{AppError, AppResult};
use crate::utils::RegenerationBudget;

#[derive(Debug)]
pub enum CodeRun {
    Output {
        code: String,
        output: SandboxOutput,
        generations: u32,
    },
    Failed {
        code: Option<String>,
        generations: u32,
    },
}

pub struct CodeGenerationAgent {
    llm: Arc<LLM>,
    sandbox: Arc<dyn CodeSandbox>,
    limits: SandboxLimits,
    sample_rows: usize,
}

impl CodeGenerationAgent {
    pub fn new(llm: Arc<LLM>, sandbox: Arc<dyn CodeSandbox>, limits: SandboxLimits, sample_rows: usize) -> Self {
        Self {
            llm,
            sandbox,
            limits,
            sample_rows,
        }
    }

    pub async fn run(&self, ctx: &AgentContext<'_>, dataset: &Dataset) -> AppResult<CodeRun> {
        let mut budget = RegenerationBudget::new("code");
        let mut feedback: Option<String> = None;
        let mut last_code = None;

        while budget.begin() {
            let prompt = self.create_code_prompt(ctx, dataset, feedback.as_deref());
            let raw = self.llm.complete(&prompt, ctx.history, &CompletionOptions::GENERATION).await?;
            let code = prompts::extract_code_block(&raw, "python");
            last_code = Some(code.clone());

            let failure = match self.sandbox.run(&code, dataset, &self.limits).await {
                Ok(output) if output.stdout.trim().is_empty() => {
                    "The code printed nothing. Print the results the question needs.".to_string()
                }
                Ok(output) => {
                    info!(
                        attempt = budget.generations(),
                        duration_ms = output.duration_ms,
                        truncated = output.truncated,
                        "Analysis code executed"
                    );
                    return Ok(CodeRun::Output {
                        code,
                        output,
                        generations: budget.generations(),
                    });
                }
                Err(SandboxError::Unavailable(reason)) => {
                    return Err(AppError::Internal(format!("code sandbox unavailable: {reason}")));
                }
                Err(err) => Self::describe_failure(&err, &self.limits),
            };

            warn!(attempt = budget.generations(), failure = %failure, code = %code, "Analysis code failed");
            feedback = Some(failure);
        }

        Ok(CodeRun::Failed {
            code: last_code,
            generations: budget.generations(),
        })
    }

    fn describe_failure(err: &SandboxError, limits: &SandboxLimits) -> String {
        match err {
            SandboxError::Timeout(_) => format!(
                "The code did not finish within {}ms. Use vectorised pandas/numpy operations and avoid loops over rows.",
                limits.timeout.as_millis()
            ),
            SandboxError::Exception(detail) => format!("The code raised an error:\n{detail}"),
            SandboxError::Disallowed(what) => {
                format!("The code was refused before running because of {what}. Use only the allowed modules and no file access.")
            }
            SandboxError::Unavailable(reason) => reason.clone(),
        }
    }

    fn create_code_prompt(&self, ctx: &AgentContext<'_>, dataset: &Dataset, feedback: Option<&str>) -> Prompt {
        let mut user = format!(
            "Question: {}\n\nDataset `df`:\n{}\n\nWrite Python code that answers the question from `df`.",
            ctx.question,
            dataset.render_shape(self.sample_rows)
        );
        if let Some(description) = Self::table_notes(ctx) {
            user.push_str("\n\nField notes:\n");
            user.push_str(&description);
        }
        if let Some(feedback) = feedback {
            user.push_str("\n\nYour previous attempt failed. ");
            user.push_str(feedback);
        }
        Prompt::new(prompts::CODE_SYSTEM, user)
    }

    /// Knowledge-base descriptions of the tables in the schema, for units.
    fn table_notes(ctx: &AgentContext<'_>) -> Option<String> {
        let notes: Vec<String> = ctx
            .schema
            .tables
            .iter()
            .filter_map(|t| t.description.as_deref().map(|d| format!("{}: {}", t.name, d)))
            .collect();
        (!notes.is_empty()).then(|| notes.join("\n"))
    }
}
