//! Executed-step records and target-key derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::ToolCall;

/// Who originated a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepSource {
    /// Proposed by the model and executed by the loop.
    Model,
    /// Performed by the human operator as an override.
    Human,
}

impl std::fmt::Display for StepSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepSource::Model => write!(f, "MODEL"),
            StepSource::Human => write!(f, "HUMAN"),
        }
    }
}

impl std::str::FromStr for StepSource {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MODEL" => Ok(StepSource::Model),
            "HUMAN" => Ok(StepSource::Human),
            _ => Err(crate::error::ProtoError::InvalidSource(s.to_string())),
        }
    }
}

/// What happened to a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Handler ran and returned output.
    Succeeded { output: String },
    /// Handler ran and failed (`ActionError`).
    Failed { error: String },
    /// Never executed: a human step on the same target took precedence.
    Suppressed { by_sequence: u64 },
    /// Never executed: the run was cancelled while the call was still queued.
    Abandoned,
}

/// Immutable record of one executed (or suppressed) tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the trace, strictly increasing from 1.
    pub sequence: u64,
    /// Id of the originating call.
    pub call_id: String,
    /// Tool that was invoked.
    pub tool_name: String,
    /// Arguments as proposed (secret placeholders unresolved).
    pub arguments: Value,
    /// Origin of the call.
    pub source: StepSource,
    /// Result of the call.
    pub outcome: StepOutcome,
    /// Identity of what the step acts on.
    pub target_key: String,
    /// When the step was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl Step {
    /// Builds a step from a call; `target_key` is derived from the call.
    pub fn from_call(
        sequence: u64,
        call: &ToolCall,
        source: StepSource,
        outcome: StepOutcome,
    ) -> Self {
        Self {
            sequence,
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            source,
            outcome,
            target_key: call.target_key(),
            recorded_at: Utc::now(),
        }
    }

    /// True when the handler actually ran (success or failure).
    pub fn was_executed(&self) -> bool {
        matches!(
            self.outcome,
            StepOutcome::Succeeded { .. } | StepOutcome::Failed { .. }
        )
    }

    /// True when the handler ran and succeeded.
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Succeeded { .. })
    }

    /// Returns the call this step recorded.
    pub fn to_call(&self) -> ToolCall {
        ToolCall::with_id(&self.call_id, &self.tool_name, self.arguments.clone())
    }
}

/// Derives the identity of what a call acts on.
///
/// Resolution order: `css_selector`, `selector`, `url`, then the tool name with
/// its canonical arguments. Keys that differ are independent actions.
pub fn target_key(tool_name: &str, arguments: &Value) -> String {
    for field in ["css_selector", "selector"] {
        if let Some(selector) = arguments.get(field).and_then(Value::as_str) {
            let selector = selector.trim();
            if !selector.is_empty() {
                return normalize_selector(selector);
            }
        }
    }

    if let Some(url) = arguments.get("url").and_then(Value::as_str) {
        let url = url.trim().trim_end_matches('/');
        if !url.is_empty() {
            return format!("url:{url}");
        }
    }

    format!("{tool_name}:{}", canonical_json(arguments))
}

fn normalize_selector(selector: &str) -> String {
    if selector.starts_with("xpath=") {
        return selector.to_string();
    }
    if selector.starts_with('/') || selector.starts_with("html/") {
        return format!("xpath={selector}");
    }
    selector.to_string()
}

/// Renders JSON with object keys sorted so equal values render equally.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
