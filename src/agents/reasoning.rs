//! Reasoning Sub-agent
//!
//! Final stage of the analysis chain: narrates the executed code's output.
//! The output is the source of truth for every number in the answer.

use std::sync::Arc;

use tracing::info;

use crate::agents::{fidelity, prompts, AgentContext};
use crate::dataset::Dataset;
use crate::llm::{CompletionOptions, Prompt, LLM};
use crate::types::AppResult;

pub struct ReasoningAgent {
    llm: Arc<LLM>,
}

impl ReasoningAgent {
    pub fn new(llm: Arc<LLM>) -> Self {
        Self { llm }
    }

    pub async fn explain(&self, ctx: &AgentContext<'_>, dataset: &Dataset, code_output: &str) -> AppResult<String> {
        let summary = dataset.render_summary();
        let prompt = Prompt::new(
            prompts::REASONING_SYSTEM,
            prompts::with_flight_hint(
                format!(
                    "Question: {}\n\nExtracted data summary:\n{}\n\nAnalysis output:\n{}",
                    ctx.question,
                    summary,
                    code_output.trim()
                ),
                ctx.flight_hint,
            ),
        );

        let narration = self.llm.complete(&prompt, ctx.history, &CompletionOptions::NARRATION).await?;
        info!(insight_len = narration.len(), "Insight generated");
        Ok(fidelity::enforce(
            "reasoning",
            narration,
            &[code_output, summary.as_str(), ctx.question],
            code_output,
        ))
    }
}
