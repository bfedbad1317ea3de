//! Data Extraction Sub-agent
//!
//! First stage of the analysis chain. Pulls the raw rows an analytical
//! question needs through the SQL agent's generate/validate/execute loop.

use std::sync::Arc;

use tracing::info;

use crate::agents::sql_query::{Fetch, FetchTask, SqlQueryAgent};
use crate::agents::AgentContext;
use crate::dataset::Dataset;
use crate::models::QueryPlan;
use crate::types::AppResult;

pub const EMPTY_EXTRACTION_CLARIFICATION: &str = "The flight log has no rows matching what this analysis needs. \
Could you check the time range or parameters in your question, or name the fields you want analysed?";

#[derive(Debug)]
pub enum Extraction {
    Data { plan: QueryPlan, dataset: Dataset },
    Clarify { plan: QueryPlan, text: String },
}

pub struct DataExtractionAgent {
    sql: Arc<SqlQueryAgent>,
}

impl DataExtractionAgent {
    pub fn new(sql: Arc<SqlQueryAgent>) -> Self {
        Self { sql }
    }

    pub async fn extract(&self, ctx: &AgentContext<'_>) -> AppResult<Extraction> {
        match self.sql.fetch(ctx, FetchTask::Extract).await? {
            Fetch::Rejected { plan, clarification } => Ok(Extraction::Clarify { plan, text: clarification }),
            Fetch::Rows { plan, result } if result.is_empty() => {
                info!("Extraction returned no rows");
                Ok(Extraction::Clarify {
                    plan,
                    text: EMPTY_EXTRACTION_CLARIFICATION.to_string(),
                })
            }
            Fetch::Rows { plan, result } => {
                info!(
                    row_count = result.row_count(),
                    columns = result.columns.len(),
                    truncated = result.truncated,
                    "Dataset extracted"
                );
                Ok(Extraction::Data { plan, dataset: Dataset::from(result) })
            }
        }
    }
}
