use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// LLM provider presets.
///
/// Each preset auto-configures `base_url` and supplies a default model ID so
/// that users only have to specify what differs from the preset defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreset {
    /// OpenAI API (api.openai.com). Default.
    #[default]
    OpenAi,
    /// Anthropic Messages API (api.anthropic.com).
    Anthropic,
    /// Together.ai – OpenAI-compatible endpoint; base_url auto-set.
    Together,
    /// Local Ollama instance – OpenAI-compatible; base_url auto-set, no API key needed.
    Ollama,
    /// OpenRouter – aggregates many providers; base_url auto-set.
    OpenRouter,
    /// Fully custom: set `base_url` and `model` manually.
    Custom,
}

impl ProviderPreset {
    /// Default model ID for the preset. Used when `[agent] model` is empty.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-sonnet-4-6",
            Self::Together => "meta-llama/Llama-3.3-70B-Instruct-Turbo",
            Self::Ollama => "llama3.2",
            Self::OpenRouter => "openai/gpt-4o",
            Self::Custom => "",
        }
    }

    /// Auto-configured API base URL (`None` = use the SDK's built-in default).
    pub fn base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => None,
            Self::Anthropic => Some("https://api.anthropic.com"),
            Self::Together => Some("https://api.together.xyz/v1"),
            Self::Ollama => Some("http://localhost:11434/v1"),
            Self::OpenRouter => Some("https://openrouter.ai/api/v1"),
            Self::Custom => None,
        }
    }

    /// Name of the provider-specific API key environment variable.
    /// Empty string means no API key is required (e.g. Ollama).
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Together => "TOGETHER_API_KEY",
            Self::Ollama => "",
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::Custom => "OPENAI_API_KEY",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Together => "together",
            Self::Ollama => "ollama",
            Self::OpenRouter => "openrouter",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for ProviderPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "together" => Ok(Self::Together),
            "ollama" => Ok(Self::Ollama),
            "openrouter" => Ok(Self::OpenRouter),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub scripts: ScriptsConfig,

    #[serde(default)]
    pub control: ControlConfig,

    /// Values for `${NAME}` placeholders in browser action arguments.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

fn default_max_rounds() -> usize {
    agent::runtime::DEFAULT_MAX_ROUNDS
}

/// Agent model/provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider preset: openai | anthropic | together | ollama | openrouter | custom.
    #[serde(default)]
    pub provider: ProviderPreset,
    /// Model ID. Leave empty (or omit) to use the preset default.
    #[serde(default)]
    pub model: String,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// DECIDE rounds per run before the run fails.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Explicit API base URL. Overrides the preset URL when non-empty.
    /// Required for `provider = "custom"`; optional for others.
    pub base_url: Option<String>,
    /// Replaces the built-in browser agent system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: ProviderPreset::default(),
            model: String::new(),
            api_key: String::new(),
            max_rounds: default_max_rounds(),
            base_url: None,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Returns the effective model ID.
    /// Falls back to the preset default when `model` is empty.
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    /// Returns the effective API base URL.
    /// Priority: explicit `base_url` field > preset auto-URL > `None`.
    pub fn effective_base_url(&self) -> Option<&str> {
        if let Some(url) = &self.base_url
            && !url.is_empty()
        {
            return Some(url.as_str());
        }
        self.provider.base_url()
    }
}

fn default_action_timeout_secs() -> u64 {
    15
}

/// Chromium settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run without a visible window. The operator usually wants to watch.
    #[serde(default)]
    pub headless: bool,
    /// Default per-action timeout, clamped by the driver to 1..=60.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

/// Script store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// SQLite file path.
    pub database: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            database: format!("{home}/.handoff/scripts.db"),
        }
    }
}

fn default_pause_reminder_secs() -> u64 {
    agent::runtime::DEFAULT_PAUSE_REMINDER.as_secs()
}

/// Pause/override settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Seconds between reminders while a run sits paused.
    #[serde(default = "default_pause_reminder_secs")]
    pub pause_reminder_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            pause_reminder_secs: default_pause_reminder_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join("handoff.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".handoff").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Config::default()
        };

        // Environment variable overrides
        if let Ok(key) = std::env::var("HANDOFF_API_KEY") {
            config.agent.api_key = key;
        }
        if let Ok(model) = std::env::var("HANDOFF_MODEL") {
            config.agent.model = model;
        }
        if let Ok(provider) = std::env::var("HANDOFF_PROVIDER") {
            config.agent.provider = provider.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "HANDOFF_PROVIDER".to_string(),
                reason,
            })?;
        }
        if let Ok(headless) = std::env::var("HANDOFF_HEADLESS") {
            config.browser.headless = matches!(
                headless.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Ok(db) = std::env::var("HANDOFF_DB") {
            config.scripts.database = db;
        }

        config.validate()?;
        debug!(
            provider = %config.agent.provider.name(),
            model = %config.agent.effective_model(),
            base_url = ?config.agent.effective_base_url(),
            secrets = config.secrets.len(),
            "Config loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_rounds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.control.pause_reminder_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "control.pause_reminder_secs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.agent.provider == ProviderPreset::Custom && self.agent.effective_base_url().is_none()
        {
            return Err(ConfigError::MissingField("agent.base_url".to_string()));
        }
        Ok(())
    }

    /// Resolves the API key to use for the configured provider.
    ///
    /// Priority:
    /// 1. `agent.api_key` in config file (or `HANDOFF_API_KEY` applied at load time)
    /// 2. Provider-specific environment variable (e.g. `ANTHROPIC_API_KEY`)
    /// 3. `OPENAI_API_KEY`
    pub fn resolve_api_key(&self) -> String {
        if !self.agent.api_key.is_empty() {
            debug!(source = "config", provider = %self.agent.provider.name(), "API key resolved");
            return self.agent.api_key.clone();
        }

        let env_var = self.agent.provider.api_key_env();
        if !env_var.is_empty()
            && let Ok(key) = std::env::var(env_var)
        {
            debug!(source = "env", env_var = %env_var, "API key resolved");
            return key;
        }

        let fallback = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if fallback.is_empty() {
            debug!(provider = %self.agent.provider.name(), "No API key found from any source");
        }
        fallback
    }

    /// Settings for one agent loop.
    pub fn loop_config(&self) -> agent::AgentConfig {
        agent::AgentConfig {
            model: self.agent.effective_model().to_string(),
            max_rounds: self.agent.max_rounds,
            pause_reminder: Duration::from_secs(self.control.pause_reminder_secs),
            system_prompt: self.agent.system_prompt.clone(),
        }
    }
}
