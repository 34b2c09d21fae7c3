//! Primitive browser tools discovered from a driver's capabilities.

use std::sync::Arc;

use async_trait::async_trait;
use proto::ToolResult;
use serde_json::Value;
use tracing::{debug, info};

use crate::Tool;
use crate::driver::{ActionSpec, BrowserDriver};
use crate::secrets::SecretResolver;

/// Prefix shared by every primitive tool name.
pub const PRIMITIVE_PREFIX: &str = "browser_";

/// A tool that forwards one driver action.
pub struct PrimitiveTool {
    name: String,
    spec: ActionSpec,
    driver: Arc<dyn BrowserDriver>,
    secrets: Arc<SecretResolver>,
}

impl PrimitiveTool {
    pub fn new(
        spec: ActionSpec,
        driver: Arc<dyn BrowserDriver>,
        secrets: Arc<SecretResolver>,
    ) -> Self {
        Self {
            name: format!("{PRIMITIVE_PREFIX}{}", spec.name),
            spec,
            driver,
            secrets,
        }
    }

    /// Driver action this tool invokes.
    pub fn action(&self) -> &str {
        &self.spec.name
    }
}

#[async_trait]
impl Tool for PrimitiveTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.parameters.clone()
    }

    async fn execute(&self, call_id: &str, args: Value) -> ToolResult {
        let resolved = self.secrets.resolve_value(&args);
        match self.driver.perform_action(&self.spec.name, &resolved).await {
            Ok(output) => {
                debug!(tool = %self.name, "Browser action succeeded");
                ToolResult::success(call_id, &self.name, output.to_string())
            }
            Err(e) => ToolResult::error(call_id, &self.name, e.to_string()),
        }
    }
}

/// Builds one primitive tool per driver capability.
pub fn discover_primitives(
    driver: Arc<dyn BrowserDriver>,
    secrets: Arc<SecretResolver>,
) -> Vec<PrimitiveTool> {
    let tools: Vec<PrimitiveTool> = driver
        .capabilities()
        .into_iter()
        .map(|spec| PrimitiveTool::new(spec, driver.clone(), secrets.clone()))
        .collect();
    info!(count = tools.len(), "Discovered browser primitives");
    tools
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proto::BrowserError;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::driver::{PageState, standard_actions};

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl BrowserDriver for RecordingDriver {
        fn capabilities(&self) -> Vec<ActionSpec> {
            standard_actions()
        }

        async fn perform_action(&self, name: &str, args: &Value) -> Result<Value, BrowserError> {
            self.calls.lock().await.push((name.to_string(), args.clone()));
            if name == "click" && args["selector"] == "#missing" {
                return Err(BrowserError::Action("Failed to find element '#missing'".to_string()));
            }
            Ok(json!({"action": name}))
        }

        async fn observe_state(&self) -> Result<PageState, BrowserError> {
            Ok(PageState::default())
        }
    }

    fn secrets() -> Arc<SecretResolver> {
        Arc::new(SecretResolver::without_env(HashMap::from([(
            "PASSWORD".to_string(),
            "hunter2".to_string(),
        )])))
    }

    #[test]
    fn discovery_prefixes_every_capability() {
        let driver = Arc::new(RecordingDriver::default());
        let tools = discover_primitives(driver, secrets());
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"browser_navigate"));
        assert!(names.contains(&"browser_fill"));
        assert_eq!(names.len(), standard_actions().len());
        assert!(tools.iter().all(|t| t.origin() == proto::ToolOrigin::Primitive));
    }

    #[tokio::test]
    async fn execute_resolves_secrets_only_for_the_driver() {
        let driver = Arc::new(RecordingDriver::default());
        let tools = discover_primitives(driver.clone(), secrets());
        let fill = tools
            .iter()
            .find(|t| t.action() == "fill")
            .expect("fill primitive");

        let args = json!({"selector":"#pw","text":"${PASSWORD}"});
        let result = fill.execute("call-1", args.clone()).await;
        assert!(!result.is_error);
        assert_eq!(result.tool_name, "browser_fill");

        let calls = driver.calls.lock().await;
        assert_eq!(calls[0].0, "fill");
        assert_eq!(calls[0].1["text"], "hunter2");
        assert_eq!(args["text"], "${PASSWORD}");
    }

    #[tokio::test]
    async fn driver_failure_becomes_error_result() {
        let driver = Arc::new(RecordingDriver::default());
        let tools = discover_primitives(driver, secrets());
        let click = tools
            .iter()
            .find(|t| t.action() == "click")
            .expect("click primitive");

        let result = click.execute("call-2", json!({"selector":"#missing"})).await;
        assert!(result.is_error);
        assert_eq!(result.call_id, "call-2");
        assert!(result.output.contains("#missing"));
    }
}
