use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A proposed tool invocation, from the model or the operator. Not yet executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier; model calls carry the provider's id.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments for the tool.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a call with a freshly generated id.
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    /// Creates a call with an explicit id.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Returns the target key this call would act on.
    pub fn target_key(&self) -> String {
        crate::step::target_key(&self.name, &self.arguments)
    }
}

/// Where a tool came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolOrigin {
    /// Discovered from the browser driver at startup.
    #[default]
    Primitive,
    /// Produced by script synthesis.
    Synthesized,
}

impl std::fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolOrigin::Primitive => write!(f, "primitive"),
            ToolOrigin::Synthesized => write!(f, "synthesized"),
        }
    }
}

/// Catalog entry exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description for tool selection.
    pub description: String,
    /// JSON schema of accepted arguments.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Creates a tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result of running a tool handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Call id this result answers.
    pub call_id: String,
    /// Name of the tool that produced it.
    pub tool_name: String,
    /// Output payload, or the error message when `is_error` is set.
    pub output: String,
    /// Whether the handler failed.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful result.
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            is_error: false,
        }
    }

    /// Creates a failed result.
    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: message.into(),
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_new_generates_distinct_ids() {
        let a = ToolCall::new("browser_click", serde_json::json!({"selector":"#a"}));
        let b = ToolCall::new("browser_click", serde_json::json!({"selector":"#a"}));
        assert!(a.id.starts_with("call_"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn tool_call_target_key_uses_selector() {
        let call = ToolCall::new(
            "browser_fill",
            serde_json::json!({"selector":" #email ","text":"x"}),
        );
        assert_eq!(call.target_key(), "#email");
    }

    #[test]
    fn tool_result_constructors_set_error_flag() {
        let ok = ToolResult::success("c1", "browser_click", "done");
        assert!(!ok.is_error);
        assert_eq!(ok.output, "done");

        let err = ToolResult::error("c2", "browser_click", "no such element");
        assert!(err.is_error);
        assert_eq!(err.call_id, "c2");
    }

    #[test]
    fn tool_origin_serializes_lowercase() {
        let json = serde_json::to_string(&ToolOrigin::Synthesized).expect("serialize");
        assert_eq!(json, "\"synthesized\"");
        assert_eq!(ToolOrigin::default(), ToolOrigin::Primitive);
    }
}
