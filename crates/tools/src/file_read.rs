//! File read tool: read file contents with optional root scoping.

use async_trait::async_trait;
use ferrobot_core::error::ToolError;
use ferrobot_core::tool::Tool;
use std::path::PathBuf;

pub struct FileReadTool {
    /// If set, reads are confined to this directory.
    allowed_root: Option<PathBuf>,
}

impl FileReadTool {
    /// Create a file read tool with no path restrictions.
    pub fn new() -> Self {
        Self { allowed_root: None }
    }

    /// Confine reads to the given root directory.
    pub fn scoped_to(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: Some(root.into()),
        }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a candidate path against an optional root, resolving symlinks and
/// relative components first.
pub(crate) fn check_scope(path: &str, root: &Option<PathBuf>) -> Result<(), String> {
    let Some(root) = root else {
        return Ok(());
    };
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
    if resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(format!("path outside allowed root {}", root.display()))
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        if let Err(reason) = check_scope(path, &self.allowed_root) {
            return Err(ToolError::PermissionDenied {
                tool_name: "file_read".into(),
                reason,
            });
        }

        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "file_read".into(),
                reason: format!("{path}: {e}"),
            })
    }
}
