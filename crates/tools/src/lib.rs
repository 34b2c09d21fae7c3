//! Tool trait, browser collaborator, and primitive browser tools.
//!
//! The agent loop uses this crate to reach the browser: a [`BrowserDriver`]
//! performs single actions and reports page state, and [`discover_primitives`]
//! turns the driver's fixed capability list into registrable tools.

pub mod browser;
pub mod driver;
pub mod primitive;
pub mod schema;
pub mod secrets;

pub use browser::ChromiumDriver;
pub use driver::{ActionSpec, BrowserDriver, InteractiveElement, PageState, standard_actions};
pub use primitive::{PRIMITIVE_PREFIX, PrimitiveTool, discover_primitives};
pub use schema::ArgumentValidator;
pub use secrets::{SecretResolver, Segment, placeholder_segments};

use async_trait::async_trait;
use proto::{ToolOrigin, ToolResult};

/// Trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name exposed to the LLM.
    fn name(&self) -> &str;
    /// Human-readable description for tool selection.
    fn description(&self) -> &str;
    /// JSON schema for accepted tool arguments.
    fn parameters_schema(&self) -> serde_json::Value;
    /// Whether the tool is a browser primitive or a synthesized script.
    fn origin(&self) -> ToolOrigin {
        ToolOrigin::Primitive
    }
    /// Executes the tool with the given call id and JSON args.
    async fn execute(&self, call_id: &str, args: serde_json::Value) -> ToolResult;
}
