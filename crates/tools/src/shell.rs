//! Shell tool: execute system commands.
//!
//! Supports base-command allowlisting, a working directory, and a timeout
//! that kills the process.

use async_trait::async_trait;
use ferrobot_config::ExecConfig;
use ferrobot_core::error::ToolError;
use ferrobot_core::tool::Tool;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest tool result fed back to the model.
const MAX_OUTPUT_LEN: usize = 10_000;

/// Execute shell commands with safety constraints.
pub struct ExecTool {
    /// If non-empty, only these base commands are allowed.
    allowed_commands: Vec<String>,
    timeout: Duration,
    working_dir: Option<String>,
}

impl ExecTool {
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            allowed_commands: config.allowed_commands.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            working_dir: config.working_dir.clone(),
        }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true; // No allowlist = all commands allowed
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use this for running programs, checking files, git operations, etc."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "exec".into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        debug!(command = %command, "Executing shell command");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| ToolError::ExecutionFailed {
                tool_name: "exec".into(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                warn!(command = %command, "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: "exec".into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut parts: Vec<String> = Vec::new();
        if !stdout.trim().is_empty() {
            parts.push(stdout.trim().to_string());
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", stderr.trim()));
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            parts.push(format!("Exit code: {code}"));
        }

        let mut result = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };

        if result.len() > MAX_OUTPUT_LEN {
            let omitted = result.len() - MAX_OUTPUT_LEN;
            let mut cut = MAX_OUTPUT_LEN;
            while !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
            result.push_str(&format!("\n... (truncated, {omitted} more chars)"));
        }

        Ok(result)
    }
}
