//! Error types for the Ferrobot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Note that hitting the turn iteration cap is *not* an error; it is a
//! defined terminal state carried by `TurnStatus` in the agent crate.

use thiserror::Error;

/// The top-level error type for all Ferrobot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Extension hook errors ---
    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    // --- Agent-level errors ---
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    // --- Session persistence ---
    #[error("Session error: {0}")]
    Session(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures from the LLM backend. Anything that escapes a provider's own
/// retry policy is fatal for the current turn only.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Unauthorized sender: {sender_id} on {channel}")]
    Unauthorized { channel: String, sender_id: String },

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),
}

/// Tool failures. These never cross the registry boundary as errors; the
/// registry converts every variant into an `"Error: ..."` string so the
/// model can self-correct.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },
}

/// A failure raised by an extension hook. Aborts the current turn only.
#[derive(Debug, Error)]
#[error("Extension '{extension}' failed in {hook}: {reason}")]
pub struct ExtensionError {
    pub extension: String,
    pub hook: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Subagent capacity exceeded ({limit} running)")]
    CapacityExceeded { limit: usize },

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Terminal mode not configured")]
    TerminalNotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::Api {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::DuplicateName("exec".into()));
        assert!(err.to_string().contains("exec"));
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn capacity_error_carries_limit() {
        let err = AgentError::CapacityExceeded { limit: 3 };
        assert!(err.to_string().contains('3'));
    }
}
