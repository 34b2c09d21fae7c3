//! Script synthesis: turning a finished trace into a replayable tool.
//!
//! For every target touched by a successful human step, only the last such
//! human step survives, at its own position in the trace. Targets without a
//! human step keep their successful model steps in order. Failed steps and
//! suppression markers never make it into a script.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use proto::{Error, RunId, ScriptError, Step, StepSource, ToolCall, ToolError, ToolOrigin, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tools::Tool;
use tracing::{debug, info, warn};

use crate::runtime::{RunReport, RunStatus};
use crate::tool_registry::{RegisterMode, ToolRegistry};
use crate::trace::ExecutionTrace;

/// Prefix of every synthesized tool name.
pub const SCRIPT_PREFIX: &str = "script_";
const MAX_SLUG_CHARS: usize = 36;
const MAX_NAME_ATTEMPTS: usize = 50;

/// A named, ordered list of winning steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Tool name the script registers under.
    pub name: String,
    /// Task instruction the script was distilled from.
    pub task: String,
    /// Steps to replay, in trace order.
    pub steps: Vec<Step>,
    /// Run that produced the trace.
    pub run_id: RunId,
    /// Whether the run was cancelled before it completed.
    #[serde(default)]
    pub partial: bool,
    pub created_at: DateTime<Utc>,
    /// Full trace the script was built from, suppressions included.
    #[serde(default)]
    pub created_from: ExecutionTrace,
}

impl Script {
    pub fn description(&self) -> String {
        let partial = if self.partial { " (partial)" } else { "" };
        format!(
            "Replays {} recorded browser steps{partial} for the task: {}",
            self.steps.len(),
            self.task
        )
    }

    /// The calls a replay performs, in order.
    pub fn calls(&self) -> Vec<ToolCall> {
        self.steps.iter().map(Step::to_call).collect()
    }

    pub fn to_json(&self) -> Result<String, ScriptError> {
        serde_json::to_string_pretty(self).map_err(|e| ScriptError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ScriptError> {
        let script: Script =
            serde_json::from_str(raw).map_err(|e| ScriptError::Serialization(e.to_string()))?;
        if !script.name.starts_with(SCRIPT_PREFIX) {
            return Err(ScriptError::Serialization(format!(
                "script name '{}' must start with '{SCRIPT_PREFIX}'",
                script.name
            )));
        }
        Ok(script)
    }
}

/// Picks the steps a script keeps.
pub fn winning_steps(trace: &ExecutionTrace) -> Vec<Step> {
    let mut last_human: HashMap<&str, u64> = HashMap::new();
    for step in trace.steps() {
        if step.source == StepSource::Human && step.succeeded() {
            last_human.insert(step.target_key.as_str(), step.sequence);
        }
    }

    trace
        .steps()
        .iter()
        .filter(|step| step.succeeded())
        .filter(|step| match last_human.get(step.target_key.as_str()) {
            Some(sequence) => step.sequence == *sequence,
            None => true,
        })
        .cloned()
        .collect()
}

/// Builds the base name `script_<yyyymmdd_HHMMSS>_<task slug>`.
pub fn script_name(task: &str, at: DateTime<Utc>) -> String {
    let mut slug = String::new();
    for c in task.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
        if slug.len() >= MAX_SLUG_CHARS {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    let slug = if slug.is_empty() { "task" } else { slug };
    format!("{SCRIPT_PREFIX}{}_{slug}", at.format("%Y%m%d_%H%M%S"))
}

/// Converts finished runs into scripts and registers them
pub struct ScriptSynthesizer {
    registry: Arc<ToolRegistry>,
}

impl ScriptSynthesizer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Builds a script from a run report without registering it.
    pub fn synthesize(&self, report: &RunReport) -> Result<Script, ScriptError> {
        let steps = winning_steps(&report.trace);
        if steps.is_empty() {
            return Err(ScriptError::Empty(report.task.clone()));
        }
        let created_at = Utc::now();
        debug!(
            kept = steps.len(),
            recorded = report.trace.len(),
            "Synthesized script steps"
        );
        Ok(Script {
            name: script_name(&report.task, created_at),
            task: report.task.clone(),
            steps,
            run_id: report.run_id.clone(),
            partial: report.status == RunStatus::Cancelled,
            created_at,
            created_from: report.trace.clone(),
        })
    }

    /// Registers `script` as a tool. A taken name is retried with a numeric
    /// suffix; the returned script carries the name actually used.
    pub fn register(&self, mut script: Script) -> Result<Script, Error> {
        let base = script.name.clone();
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            if attempt > 1 {
                script.name = format!("{base}_{attempt}");
            }
            let tool = ScriptTool::new(script.clone(), Arc::downgrade(&self.registry));
            match self.registry.register(tool, RegisterMode::Reject) {
                Ok(()) => {
                    info!(name = %script.name, steps = script.steps.len(), "Script registered");
                    return Ok(script);
                }
                Err(ToolError::DuplicateName(name)) => {
                    debug!("Script name {name} taken, retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }
        warn!("No free name for script {base}");
        Err(ScriptError::NameExhausted(MAX_NAME_ATTEMPTS).into())
    }

    /// Synthesizes and registers in one step.
    pub fn synthesize_and_register(&self, report: &RunReport) -> Result<Script, Error> {
        let script = self.synthesize(report)?;
        self.register(script)
    }
}

/// A synthesized script exposed as a tool
pub struct ScriptTool {
    script: Script,
    description: String,
    registry: Weak<ToolRegistry>,
}

impl ScriptTool {
    pub fn new(script: Script, registry: Weak<ToolRegistry>) -> Self {
        Self {
            description: script.description(),
            script,
            registry,
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Replays every step, stopping at the first failure.
    pub async fn replay(&self, call_id: &str) -> Result<Vec<String>, ScriptError> {
        let registry = self.registry.upgrade().ok_or_else(|| ScriptError::ReplayFailed {
            index: 0,
            tool: self.script.name.clone(),
            reason: "tool registry is gone".to_string(),
        })?;

        let mut outputs = Vec::with_capacity(self.script.steps.len());
        for (index, step) in self.script.steps.iter().enumerate() {
            let call = ToolCall::with_id(
                format!("{call_id}.{}", index + 1),
                &step.tool_name,
                step.arguments.clone(),
            );
            debug!(script = %self.script.name, index, tool = %call.name, "Replaying step");
            let result = registry
                .execute(&call)
                .await
                .map_err(|e| ScriptError::ReplayFailed {
                    index: index + 1,
                    tool: call.name.clone(),
                    reason: e.to_string(),
                })?;
            if result.is_error {
                return Err(ScriptError::ReplayFailed {
                    index: index + 1,
                    tool: call.name,
                    reason: result.output,
                });
            }
            outputs.push(result.output);
        }
        Ok(outputs)
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.script.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    fn origin(&self) -> ToolOrigin {
        ToolOrigin::Synthesized
    }

    async fn execute(&self, call_id: &str, _args: Value) -> ToolResult {
        match self.replay(call_id).await {
            Ok(outputs) => {
                let payload = json!({
                    "script": self.script.name,
                    "steps": outputs.len(),
                    "outputs": outputs,
                });
                ToolResult::success(call_id, self.name(), payload.to_string())
            }
            Err(e) => {
                warn!(script = %self.script.name, "Script replay failed: {e}");
                ToolResult::error(call_id, self.name(), e.to_string())
            }
        }
    }
}
