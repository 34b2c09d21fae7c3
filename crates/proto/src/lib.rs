//! Shared protocol types for the agent loop, browser tools, and operator console.
//!
//! This crate defines serializable tool/step/event structures and
//! strongly-typed error enums shared across the workspace.

pub mod error;
pub mod event;
pub mod message;
pub mod step;
pub mod tool;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of run progress events.
pub use event::{LoopState, RunEvent};
/// Re-export of conversation role and run identity types.
pub use message::{Role, RunId};
/// Re-export of executed-step record types.
pub use step::{Step, StepOutcome, StepSource, target_key};
/// Re-export of tool call definition and result types.
pub use tool::{ToolCall, ToolDefinition, ToolOrigin, ToolResult};

/// Returns `true` when the key looks like an Anthropic OAuth access token
/// (`sk-ant-oat*`) rather than a permanent API key (`sk-ant-api*`).
///
/// When this returns `true`, callers should use `Authorization: Bearer`
/// instead of `x-api-key` for Anthropic API requests.
pub fn is_anthropic_oauth_token(key: &str) -> bool {
    key.starts_with("sk-ant-oat")
}
