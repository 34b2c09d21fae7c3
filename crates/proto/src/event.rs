use serde::{Deserialize, Serialize};

use crate::step::Step;

/// States of the agent loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoopState {
    /// Asking the model for the next action.
    Decide,
    /// Running queued calls or a pending override.
    Execute,
    /// Halted at a safe point until resumed.
    Paused,
    /// Terminal.
    Done,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Decide => write!(f, "DECIDE"),
            LoopState::Execute => write!(f, "EXECUTE"),
            LoopState::Paused => write!(f, "PAUSED"),
            LoopState::Done => write!(f, "DONE"),
        }
    }
}

/// Real-time progress events emitted while a run advances.
///
/// These events are sent via `tokio::sync::mpsc` from the agent loop so that
/// consumers (e.g. the operator console) can display live state while the
/// run is in flight. Sends never block the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The loop moved between states.
    StateChanged { from: LoopState, to: LoopState },
    /// The model is being consulted (round N).
    Deciding { round: usize },
    /// The model proposed calls for this turn.
    CallsQueued { count: usize },
    /// A step (executed or suppressed) was appended to the trace.
    StepRecorded(Step),
    /// A pause request reached a safe point.
    PauseObserved { completed_steps: usize },
    /// The run has been paused for a while.
    PauseReminder { waited_secs: u64 },
    /// An operator override was accepted while paused.
    OverrideAccepted { tool_name: String, target_key: String },
    /// The run resumed after a pause.
    Resumed,
    /// The run honored a cancellation request.
    Cancelled { completed_steps: usize },
    /// The run reached `DONE`.
    Finished { steps: usize },
}
