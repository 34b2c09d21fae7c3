//! Argument validation against a tool's JSON schema (Draft 7).

use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use proto::ToolError;
use serde_json::Value;

const MAX_REPORTED_ERRORS: usize = 3;

/// Compiled input schema of one tool.
#[derive(Clone)]
pub struct ArgumentValidator {
    tool: String,
    compiled: Arc<JSONSchema>,
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("tool", &self.tool)
            .finish_non_exhaustive()
    }
}

impl ArgumentValidator {
    /// Compiles `schema`. A schema that does not compile is reported as
    /// `InvalidArguments` for the owning tool.
    pub fn compile(tool: &str, schema: &Value) -> Result<Self, ToolError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| ToolError::InvalidArguments {
                tool: tool.to_string(),
                reason: format!("schema compile: {e}"),
            })?;
        Ok(Self {
            tool: tool.to_string(),
            compiled: Arc::new(compiled),
        })
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Checks `args`; the error lists the first few violations.
    pub fn validate(&self, args: &Value) -> Result<(), ToolError> {
        if let Err(errors) = self.compiled.validate(args) {
            let reasons: Vec<String> = errors
                .take(MAX_REPORTED_ERRORS)
                .map(|err| {
                    let path = err.instance_path.to_string();
                    if path.is_empty() {
                        err.to_string()
                    } else {
                        format!("{path}: {err}")
                    }
                })
                .collect();
            return Err(ToolError::InvalidArguments {
                tool: self.tool.clone(),
                reason: reasons.join("; "),
            });
        }
        Ok(())
    }
}
