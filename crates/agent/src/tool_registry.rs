//! Tool registry used by the runtime to list and execute tools.
//!
//! The registry keeps an immutable [`Catalog`] behind a lock and swaps in a
//! fresh copy on every write. A run takes a [`ToolRegistry::snapshot`] when it
//! starts, so scripts registered later never show up mid-run.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use proto::{ToolCall, ToolDefinition, ToolError, ToolOrigin, ToolResult};
use tools::{ArgumentValidator, Tool};
use tracing::debug;

/// What `register` does when the name is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Fail with `DuplicateName` and leave the registry unchanged.
    Reject,
    /// Swap the existing entry for the new tool.
    Replace,
}

#[derive(Clone)]
struct Entry {
    tool: Arc<dyn Tool>,
    definition: ToolDefinition,
    validator: ArgumentValidator,
    origin: ToolOrigin,
}

/// Immutable view of the registered tools
#[derive(Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, Entry>,
}

impl Catalog {
    /// Looks up a tool by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.entries
            .get(name)
            .map(|e| e.tool.clone())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Origin of a registered tool.
    pub fn origin(&self, name: &str) -> Option<ToolOrigin> {
        self.entries.get(name).map(|e| e.origin)
    }

    /// Tool definitions for the LLM, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|e| e.definition.clone()).collect()
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that the tool exists and the arguments satisfy its schema.
    pub fn validate(&self, call: &ToolCall) -> Result<(), ToolError> {
        let entry = self
            .entries
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        entry.validator.validate(&call.arguments)
    }

    /// Validates then runs a call.
    ///
    /// Lookup and schema failures are returned as `Err` before any handler
    /// runs. A handler failure is an `Ok` result with `is_error` set.
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        self.validate(call)?;
        let tool = self.lookup(&call.name)?;
        debug!("Executing tool: {} (call_id: {})", call.name, call.id);
        Ok(tool.execute(&call.id, call.arguments.clone()).await)
    }
}

/// Registry of available tools
pub struct ToolRegistry {
    catalog: RwLock<Arc<Catalog>>,
}

impl ToolRegistry {
    /// Creates an empty tool registry.
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    /// Register a tool
    pub fn register(&self, tool: impl Tool + 'static, mode: RegisterMode) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool), mode)
    }

    /// Register an already shared tool
    pub fn register_arc(&self, tool: Arc<dyn Tool>, mode: RegisterMode) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let schema = tool.parameters_schema();
        let validator = ArgumentValidator::compile(&name, &schema)?;
        let entry = Entry {
            definition: ToolDefinition::new(&name, tool.description(), schema),
            origin: tool.origin(),
            validator,
            tool,
        };

        let mut guard = self.catalog.write();
        if mode == RegisterMode::Reject && guard.contains(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        let mut next = Catalog::clone(&guard);
        let replaced = next.entries.insert(name.clone(), entry).is_some();
        *guard = Arc::new(next);
        debug!(replaced, origin = %guard.entries[&name].origin, "Registered tool: {name}");
        Ok(())
    }

    /// Looks up a tool in the current catalog.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.catalog.read().lookup(name)
    }

    /// Get tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.catalog.read().definitions()
    }

    /// Returns the list of registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.catalog
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Current catalog; later registrations do not affect the returned value.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    /// Execute a tool call against the current catalog
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let catalog = self.snapshot();
        catalog.execute(call).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use proto::ToolResult;

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes the input"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type":"object",
                "properties":{"value":{"type":"string"}},
                "required":["value"]
            })
        }

        async fn execute(&self, call_id: &str, args: serde_json::Value) -> ToolResult {
            let value = args["value"].as_str().unwrap_or_default().to_string();
            ToolResult::success(call_id, self.name(), value)
        }
    }

    struct LoudEchoTool;

    #[async_trait]
    impl tools::Tool for LoudEchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes the input in upper case"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type":"object"})
        }

        fn origin(&self) -> ToolOrigin {
            ToolOrigin::Synthesized
        }

        async fn execute(&self, call_id: &str, args: serde_json::Value) -> ToolResult {
            let value = args["value"].as_str().unwrap_or_default().to_uppercase();
            ToolResult::success(call_id, self.name(), value)
        }
    }

    #[tokio::test]
    async fn register_and_execute_known_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");

        let call = ToolCall::with_id("c1", "echo", serde_json::json!({"value":"hello"}));
        let result = registry.execute(&call).await.expect("execute");
        assert!(!result.is_error);
        assert_eq!(result.output, "hello");
        assert_eq!(result.tool_name, "echo");
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_not_found() {
        let registry = ToolRegistry::new();
        let call = ToolCall::with_id("c2", "missing", serde_json::json!({}));
        let err = registry.execute(&call).await.expect_err("unknown tool");
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn invalid_arguments_fail_before_handler() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");

        let call = ToolCall::with_id("c3", "echo", serde_json::json!({"value": 5}));
        let err = registry.execute(&call).await.expect_err("wrong type");
        assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "echo"));
    }

    #[test]
    fn duplicate_registration_is_rejected_and_registry_unchanged() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");
        let before = registry.definitions();

        let err = registry
            .register(LoudEchoTool, RegisterMode::Reject)
            .expect_err("duplicate");
        assert!(matches!(err, ToolError::DuplicateName(name) if name == "echo"));
        assert_eq!(registry.definitions(), before);
        assert_eq!(registry.snapshot().origin("echo"), Some(ToolOrigin::Primitive));
    }

    #[tokio::test]
    async fn replace_mode_swaps_the_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");
        registry
            .register(LoudEchoTool, RegisterMode::Replace)
            .expect("replace");

        let call = ToolCall::with_id("c4", "echo", serde_json::json!({"value":"hi"}));
        let result = registry.execute(&call).await.expect("execute");
        assert_eq!(result.output, "HI");
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let registry = ToolRegistry::new();
        let before = registry.snapshot();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");

        assert!(before.is_empty());
        assert!(before.lookup("echo").is_err());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn definitions_and_names_include_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool, RegisterMode::Reject).expect("register");

        let names = registry.tool_names();
        assert_eq!(names, vec!["echo".to_string()]);

        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].description, "Echoes the input");
        assert_eq!(defs[0].parameters["required"][0], "value");
    }
}
