//! Data Analysis Agent
//!
//! Extraction → code generation → reasoning, strictly in sequence. Any stage
//! that ends in a clarification short-circuits the rest.

use std::sync::Arc;

use tracing::info;

use crate::agents::code_generation::{CodeGenerationAgent, CodeRun};
use crate::agents::extraction::{DataExtractionAgent, Extraction};
use crate::agents::reasoning::ReasoningAgent;
use crate::agents::sql_query::SqlQueryAgent;
use crate::agents::{AgentContext, AgentOutcome, OutcomePlan};
use crate::llm::LLM;
use crate::models::AnalysisPlan;
use crate::sandbox::{CodeSandbox, SandboxLimits};
use crate::types::AppResult;

pub const CODE_FAILED_CLARIFICATION: &str = "I wasn't able to compute that analysis from this flight's data. \
Could you narrow the question down, for example to specific parameters or a part of the flight?";

pub struct DataAnalysisAgent {
    extraction: DataExtractionAgent,
    code: CodeGenerationAgent,
    reasoning: ReasoningAgent,
}

impl DataAnalysisAgent {
    pub fn new(
        llm: Arc<LLM>,
        sql: Arc<SqlQueryAgent>,
        sandbox: Arc<dyn CodeSandbox>,
        limits: SandboxLimits,
        sample_rows: usize,
    ) -> Self {
        Self {
            extraction: DataExtractionAgent::new(sql),
            code: CodeGenerationAgent::new(llm.clone(), sandbox, limits, sample_rows),
            reasoning: ReasoningAgent::new(llm),
        }
    }

    /// `analyze(question, context, schema) -> {text, plan}`.
    pub async fn analyze(&self, ctx: &AgentContext<'_>) -> AppResult<AgentOutcome> {
        info!(question_len = ctx.question.len(), "Analysis chain started");

        let (extraction_plan, dataset) = match self.extraction.extract(ctx).await? {
            Extraction::Data { plan, dataset } => (plan, dataset),
            Extraction::Clarify { plan, text } => {
                return Ok(AgentOutcome::clarification(
                    text,
                    Some(OutcomePlan::Analysis(AnalysisPlan::new(plan))),
                ));
            }
        };

        let mut plan = AnalysisPlan::new(extraction_plan);
        let (code, output) = match self.code.run(ctx, &dataset).await? {
            CodeRun::Output { code, output, .. } => (code, output),
            CodeRun::Failed { code, generations } => {
                info!(generations, "Analysis code failed, asking for clarification");
                plan.generated_code = code;
                return Ok(AgentOutcome::clarification(
                    CODE_FAILED_CLARIFICATION,
                    Some(OutcomePlan::Analysis(plan)),
                ));
            }
        };
        plan.generated_code = Some(code);
        plan.code_execution_result = Some(output.stdout.clone());

        let insight = self.reasoning.explain(ctx, &dataset, &output.stdout).await?;
        plan.final_insight_text = Some(insight.clone());
        info!(row_count = dataset.row_count(), "Analysis chain complete");
        Ok(AgentOutcome::answered(insight, OutcomePlan::Analysis(plan)))
    }
}
