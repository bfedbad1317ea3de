// Bounded regeneration

use tracing::debug;

/// Regenerations allowed after the first generation fails validation or
/// execution.
pub const MAX_REGENERATIONS: u32 = 1;

/// Counts generation attempts for one agent stage.
///
/// A stage generates once, and may regenerate at most [`MAX_REGENERATIONS`]
/// times after a recoverable failure. Validation rejections and execution
/// failures draw from the same budget.
#[derive(Debug, Clone)]
pub struct RegenerationBudget {
    stage: &'static str,
    generations: u32,
    max_generations: u32,
}

impl RegenerationBudget {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            generations: 0,
            max_generations: 1 + MAX_REGENERATIONS,
        }
    }

    /// Claims the next generation. Returns `false` once the budget is spent.
    pub fn begin(&mut self) -> bool {
        if self.generations >= self.max_generations {
            debug!(stage = self.stage, generations = self.generations, "Regeneration budget exhausted");
            return false;
        }
        self.generations += 1;
        true
    }

    pub fn generations(&self) -> u32 {
        self.generations
    }

    pub fn is_retry(&self) -> bool {
        self.generations > 1
    }
}
