//! Configuration loading and validation for Ferrobot.
//!
//! Loads configuration from a TOML file with environment variable
//! overrides. Validates all settings at startup; API keys are redacted in
//! Debug output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default LLM model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_tokens: Option<u32>,

    /// Agent loop configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Shell tool configuration
    #[serde(default)]
    pub exec: ExecConfig,

    /// Terminal mode (per-turn subprocess delegation). Absent = disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalConfig>,

    /// Session compaction extension configuration
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Model aliases for the /model command (alias -> model id)
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,

    /// Provider credentials, keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: None,
            agent: AgentConfig::default(),
            exec: ExecConfig::default(),
            terminal: None,
            compaction: CompactionConfig::default(),
            model_aliases: HashMap::new(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool-call iterations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum messages loaded from a session as history
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Hard cap on simultaneously running subagent tasks
    #[serde(default = "default_max_subagents")]
    pub max_subagents: usize,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_max_history() -> usize {
    50
}
fn default_max_subagents() -> usize {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_history: default_max_history(),
            max_subagents: default_max_subagents(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Timeout for shell commands, seconds
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    /// If non-empty, only these base commands are allowed
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Working directory for commands (default: the workspace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

fn default_exec_timeout() -> u64 {
    60
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout(),
            allowed_commands: Vec::new(),
            working_dir: None,
        }
    }
}

/// Wire protocol for terminal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalProtocol {
    /// Wait for exit, capture all output, scan for media paths.
    #[default]
    Plain,
    /// Stream stdout as JSONL frames in real time.
    Rich,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Command template; `{message}` is replaced with the shell-quoted
    /// user text.
    pub command: String,

    #[serde(default)]
    pub protocol: TerminalProtocol,

    /// Kill the subprocess after this many seconds
    #[serde(default = "default_terminal_timeout")]
    pub timeout_secs: u64,

    /// Include media paths in the input envelope
    #[serde(default = "default_true")]
    pub pass_media: bool,

    /// Static environment variables for the subprocess
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Provider credentials forwarded in the envelope and as env vars
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_terminal_timeout() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Messages kept in the active session after archiving
    #[serde(default = "default_max_active")]
    pub max_active_messages: usize,

    /// Archive directory, relative to the workspace
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
}

fn default_max_active() -> usize {
    30
}
fn default_archive_dir() -> String {
    "sessions/archives".into()
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_active_messages: default_max_active(),
            archive_dir: default_archive_dir(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Environment overrides for the common knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("FERROBOT_MODEL") {
            self.default_model = model;
        }
        if let Ok(max) = std::env::var("FERROBOT_MAX_ITERATIONS")
            && let Ok(parsed) = max.parse()
        {
            self.agent.max_iterations = parsed;
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.max_subagents == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_subagents must be at least 1".into(),
            ));
        }
        if let Some(terminal) = &self.terminal {
            if terminal.command.trim().is_empty() {
                return Err(ConfigError::Invalid("terminal.command is empty".into()));
            }
            if terminal.timeout_secs == 0 {
                return Err(ConfigError::Invalid(
                    "terminal.timeout_secs must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Redact a secret list for Debug output.
fn redact(keys: &[String]) -> String {
    if keys.is_empty() {
        "[]".into()
    } else {
        format!("[{} key(s) redacted]", keys.len())
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_keys", &redact(&self.api_keys))
            .field("models", &self.models)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("exec", &self.exec)
            .field("terminal", &self.terminal)
            .field("compaction", &self.compaction)
            .field("model_aliases", &self.model_aliases)
            .field("providers", &self.providers)
            .finish()
    }
}
