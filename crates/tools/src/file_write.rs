//! File write tool: write or append text, creating parent directories.

use async_trait::async_trait;
use ferrobot_core::error::ToolError;
use ferrobot_core::tool::Tool;
use std::path::PathBuf;

use crate::file_read::check_scope;

pub struct FileWriteTool {
    allowed_root: Option<PathBuf>,
}

impl FileWriteTool {
    pub fn new() -> Self {
        Self { allowed_root: None }
    }

    /// Confine writes to the given root directory.
    pub fn scoped_to(root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: Some(root.into()),
        }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write text content to a file, creating parent directories as needed. \
         Set append to true to add to the end instead of overwriting."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write"
                },
                "content": {
                    "type": "string",
                    "description": "The text content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwrite (default false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let append = arguments["append"].as_bool().unwrap_or(false);

        // Scope check runs against the parent for new files, which may not
        // exist yet at canonicalize time.
        if let Err(reason) = check_scope(path, &self.allowed_root) {
            return Err(ToolError::PermissionDenied {
                tool_name: "file_write".into(),
                reason,
            });
        }

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "file_write".into(),
            reason,
        };

        if let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(format!("{}: {e}", parent.display())))?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| failed(format!("{path}: {e}")))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| failed(format!("{path}: {e}")))?;
        } else {
            tokio::fs::write(path, content)
                .await
                .map_err(|e| failed(format!("{path}: {e}")))?;
        }

        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.txt");
        let tool = FileWriteTool::new();
        let out = tool
            .execute(serde_json::json!({
                "path": path.to_str().unwrap(),
                "content": "hello"
            }))
            .await
            .unwrap();
        assert!(out.contains("5 bytes"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn append_preserves_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let tool = FileWriteTool::new();
        let args = |content: &str, append: bool| {
            serde_json::json!({
                "path": path.to_str().unwrap(),
                "content": content,
                "append": append
            })
        };
        tool.execute(args("one\n", false)).await.unwrap();
        tool.execute(args("two\n", true)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn missing_content_rejected() {
        let tool = FileWriteTool::new();
        let err = tool
            .execute(serde_json::json!({"path": "/tmp/x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
