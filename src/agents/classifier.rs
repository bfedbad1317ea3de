//! Query Classifier Agent
//!
//! Labels an inbound message SQL, ANALYSIS or NONE. Anything that is not
//! clearly one label becomes NONE.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::agents::prompts;
use crate::llm::{CompletionOptions, Prompt, LLM};
use crate::models::{Category, ClassificationResult};
use crate::types::{AppResult, LLMMessage};

/// Negating tokens after apostrophes are dropped, so contractions arrive
/// joined ("can't" is `CANT`).
const NEGATIONS: &[&str] = &[
    "NOT", "NO", "NEITHER", "NOR", "NEVER", "CANNOT", "CANT", "DONT", "DOESNT", "ISNT", "ARENT", "WONT",
    "SHOULDNT", "WOULDNT", "COULDNT", "NEEDNT", "WASNT",
];

pub struct QueryClassifier {
    llm: Arc<LLM>,
}

impl QueryClassifier {
    pub fn new(llm: Arc<LLM>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        message: &str,
        history: &[LLMMessage],
        flight_hint: Option<&str>,
    ) -> AppResult<ClassificationResult> {
        let prompt = Self::create_classification_prompt(message, flight_hint);
        let raw = self.llm.complete(&prompt, history, &CompletionOptions::LABEL).await?;

        let result = match parse_label(&raw) {
            Some(category) => ClassificationResult {
                category,
                rationale: (raw != category.label()).then(|| raw.clone()),
            },
            None => {
                warn!(raw = %raw, "Ambiguous classification, routing to NONE");
                ClassificationResult {
                    category: Category::None,
                    rationale: Some(raw),
                }
            }
        };

        info!(category = %result.category, "Message classified");
        Ok(result)
    }

    fn create_classification_prompt(message: &str, flight_hint: Option<&str>) -> Prompt {
        let task = prompts::with_flight_hint(format!("Question: {message}"), flight_hint);
        Prompt::new(prompts::CLASSIFIER_SYSTEM, task)
    }
}

fn label_of(token: &str) -> Option<Category> {
    Category::ALL.into_iter().find(|c| c.label() == token)
}

/// One of the three labels, or `None` when the text is ambiguous.
///
/// Punctuation and case are ignored. A reply that mentions exactly one label
/// and no negation ("Category: SQL.") is accepted; replies naming several
/// labels or negating one ("not SQL") are ambiguous.
pub fn parse_label(raw: &str) -> Option<Category> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(*c, '\'' | '\u{2019}'))
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { ' ' })
        .collect();
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    if let [only] = tokens.as_slice() {
        return label_of(only);
    }
    if tokens.iter().any(|t| NEGATIONS.contains(t)) {
        return None;
    }

    let labels: HashSet<Category> = tokens.iter().filter_map(|t| label_of(t)).collect();
    if labels.len() == 1 {
        labels.into_iter().next()
    } else {
        None
    }
}
