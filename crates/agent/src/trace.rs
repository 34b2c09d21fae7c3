//! Append-only record of the steps of one run.

use proto::{Step, StepOutcome, StepSource, ToolCall};
use serde::{Deserialize, Serialize};

/// Ordered log of steps. Sequence numbers start at 1 and only increase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    steps: Vec<Step>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.steps.last().map_or(1, |s| s.sequence + 1)
    }

    /// Records a call and returns the stored step.
    pub fn record(&mut self, call: &ToolCall, source: StepSource, outcome: StepOutcome) -> &Step {
        let step = Step::from_call(self.next_sequence(), call, source, outcome);
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps whose handler actually ran.
    pub fn executed(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.was_executed())
    }

    /// Model calls dropped in favour of a human step.
    pub fn suppressed(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Suppressed { .. }))
    }

    /// Queued calls left unexecuted by a cancel.
    pub fn abandoned(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Abandoned)
    }
}
