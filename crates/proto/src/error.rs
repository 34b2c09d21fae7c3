use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Tool registration/lookup/execution error.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Pause/override/resume protocol violation.
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// The model collaborator could not produce a decision.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] LlmError),

    /// Browser collaborator fault outside a single action.
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    /// Script store error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Script synthesis or (de)serialization error.
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Run exceeded the configured number of decide rounds.
    #[error("Round limit of {0} exceeded")]
    RoundLimitExceeded(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Tool registry and execution errors
#[derive(Debug, Error)]
pub enum ToolError {
    /// A tool with the same name is already registered.
    #[error("Duplicate tool name: {0}")]
    DuplicateName(String),

    /// Requested tool is unknown.
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Tool call arguments do not satisfy the tool's input schema.
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Pause controller protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// An override was submitted while the run was not paused.
    #[error("No pending pause: overrides are only accepted while paused")]
    NoPendingPause,

    /// An override is already waiting to be consumed.
    #[error("An override for '{0}' is already pending")]
    OverrideAlreadyPending(String),
}

/// Model collaborator errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Remote API failure.
    #[error("{0}")]
    Api(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Provider response schema/content was invalid.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Provider is missing credentials.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Browser collaborator errors
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Browser process could not be started.
    #[error("Launch failed: {0}")]
    Launch(String),

    /// The driver does not offer the requested action.
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// A single action failed.
    #[error("{0}")]
    Action(String),

    /// Reading the page state failed.
    #[error("Observe failed: {0}")]
    Observe(String),

    /// Action exceeded its timeout.
    #[error("Operation timed out after {0}s")]
    Timeout(u64),
}

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx operation error.
    #[error("SQLx error: {0}")]
    Sqlx(String),

    /// Migration execution error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Requested record was not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Script synthesis and encoding errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The trace contained nothing worth replaying.
    #[error("No replayable steps in trace for task '{0}'")]
    Empty(String),

    /// Every generated name collided with an existing tool.
    #[error("Could not find a free script name after {0} attempts")]
    NameExhausted(usize),

    /// JSON encoding/decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A step has no rendering in the requested export format.
    #[error("Cannot export step {index} ({tool}): {reason}")]
    Export {
        index: usize,
        tool: String,
        reason: String,
    },

    /// Replay failed at a given step.
    #[error("Replay failed at step {index} ({tool}): {reason}")]
    ReplayFailed {
        index: usize,
        tool: String,
        reason: String,
    },
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid step source string value.
    #[error("Invalid step source: {0}")]
    InvalidSource(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_config_error_variant() {
        let err = ConfigError::MissingField("agent.model".to_string());
        assert!(err.to_string().contains("Missing required field"));
    }

    #[test]
    fn wraps_tool_error_into_top_level_error() {
        let err: Error = ToolError::DuplicateName("browser_click".to_string()).into();
        assert!(err.to_string().contains("Tool error"));
        assert!(err.to_string().contains("browser_click"));
    }

    #[test]
    fn llm_error_surfaces_as_model_unavailable() {
        let err: Error = LlmError::RateLimit.into();
        assert!(matches!(err, Error::ModelUnavailable(LlmError::RateLimit)));
        assert!(err.to_string().contains("Model unavailable"));
    }

    #[test]
    fn control_errors_name_the_protocol_violation() {
        let err: Error = ControlError::NoPendingPause.into();
        assert!(err.to_string().contains("No pending pause"));

        let pending = ControlError::OverrideAlreadyPending("browser_fill".to_string());
        assert!(pending.to_string().contains("browser_fill"));
    }

    #[test]
    fn invalid_arguments_mentions_tool_and_reason() {
        let err = ToolError::InvalidArguments {
            tool: "browser_fill".to_string(),
            reason: "\"text\" is a required property".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("browser_fill"));
        assert!(rendered.contains("required property"));
    }

    #[test]
    fn wraps_database_and_script_errors() {
        let db_err: Error = DatabaseError::NotFound("script_x".to_string()).into();
        assert!(db_err.to_string().contains("Database error"));

        let script_err: Error = ScriptError::NameExhausted(8).into();
        assert!(script_err.to_string().contains("8 attempts"));
    }

    #[test]
    fn round_limit_renders_limit() {
        assert_eq!(
            Error::RoundLimitExceeded(25).to_string(),
            "Round limit of 25 exceeded"
        );
    }
}
