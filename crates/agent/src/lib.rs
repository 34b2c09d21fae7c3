//! Agent loop, pause/override control, script synthesis, and LLM adapters.

pub mod anthropic;
pub mod control;
pub mod llm;
pub mod playwright;
pub mod runtime;
pub mod store;
pub mod synth;
pub mod tool_registry;
pub mod trace;

/// Anthropic Messages API provider.
pub use anthropic::AnthropicProvider;
/// Pause, override, resume and cancel handles.
pub use control::{ControlHandle, ControlStatus, PauseController, PauseExit};
/// Chat request/response models and provider interfaces.
pub use llm::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, OpenAiProvider, TokenUsage};
/// Deterministic Playwright export of scripts.
pub use playwright::render_playwright;
/// Main decide/execute loop.
pub use runtime::{AgentConfig, AgentLoop, RunFailure, RunReport, RunStatus};
/// SQLite persistence for synthesized scripts.
pub use store::{ScriptStore, ScriptSummary};
/// Trace-to-script synthesis and replay.
pub use synth::{SCRIPT_PREFIX, Script, ScriptSynthesizer, ScriptTool, script_name, winning_steps};
/// Runtime tool registry.
pub use tool_registry::{Catalog, RegisterMode, ToolRegistry};
/// Ordered record of executed steps.
pub use trace::ExecutionTrace;
