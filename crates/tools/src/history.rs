//! Search tool over the per-session compaction archives.

use async_trait::async_trait;
use ferrobot_core::error::ToolError;
use ferrobot_core::tool::Tool;
use ferrobot_extensions::compaction::CompactionExtension;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncBufReadExt;

const PREVIEW_LEN: usize = 500;

/// Searches the JSONL archive written by session compaction for the
/// session this tool is bound to via `set_context`.
pub struct HistorySearchTool {
    workspace: String,
    archive_dir: String,
    context: Mutex<(String, String)>,
}

impl HistorySearchTool {
    pub fn new(workspace: impl Into<String>, archive_dir: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            archive_dir: archive_dir.into(),
            context: Mutex::new((String::new(), String::new())),
        }
    }

    fn archive_path(&self) -> PathBuf {
        let (channel, chat_id) = match self.context.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let session_key = format!("{channel}:{chat_id}");
        CompactionExtension::archive_path(&self.workspace, &self.archive_dir, &session_key)
    }
}

#[async_trait]
impl Tool for HistorySearchTool {
    fn name(&self) -> &str {
        "history_search"
    }

    fn description(&self) -> &str {
        "Search your archived conversation history for past messages. Use this \
         when you need to recall something discussed earlier that may no longer \
         be in your current context."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to search for in archived messages (case-insensitive)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of matching messages to return (default 10)"
                }
            },
            "required": ["query"]
        })
    }

    fn supports_context(&self) -> bool {
        true
    }

    fn set_context(&self, channel: &str, chat_id: &str) {
        let mut guard = match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = (channel.to_string(), chat_id.to_string());
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;
        let max_results = arguments["max_results"].as_u64().unwrap_or(10) as usize;

        let path = self.archive_path();
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(_) => return Ok("No archived conversation history found for this session.".into()),
        };

        let query_lower = query.to_lowercase();
        let mut results: Vec<serde_json::Value> = Vec::new();
        let mut lines = tokio::io::BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| {
            ToolError::ExecutionFailed {
                tool_name: "history_search".into(),
                reason: format!("{}: {e}", path.display()),
            }
        })? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if let Some(content) = msg["content"].as_str()
                && content.to_lowercase().contains(&query_lower)
            {
                results.push(msg);
                if results.len() >= max_results {
                    break;
                }
            }
        }

        if results.is_empty() {
            return Ok(format!("No archived messages matching '{query}'."));
        }

        let mut out = vec![format!(
            "Found {} archived message(s) matching '{query}':\n",
            results.len()
        )];
        for msg in &results {
            let role = msg["role"].as_str().unwrap_or("?");
            let content = msg["content"].as_str().unwrap_or_default();
            let preview: String = if content.chars().count() > PREVIEW_LEN {
                let truncated: String = content.chars().take(PREVIEW_LEN).collect();
                format!("{truncated}...")
            } else {
                content.to_string()
            };
            out.push(format!("[{role}] {preview}\n"));
        }
        Ok(out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_archive(dir: &std::path::Path, session_key: &str, lines: &[&str]) {
        let path = CompactionExtension::archive_path(
            dir.to_str().unwrap(),
            "archives",
            session_key,
        );
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[tokio::test]
    async fn no_archive_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = HistorySearchTool::new(dir.path().to_str().unwrap(), "archives");
        tool.set_context("cli", "direct");
        let out = tool
            .execute(serde_json::json!({"query": "anything"}))
            .await
            .unwrap();
        assert!(out.contains("No archived conversation history"));
    }

    #[tokio::test]
    async fn case_insensitive_match() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(
            dir.path(),
            "cli:direct",
            &[
                r#"{"role": "user", "content": "Remember the Alamo"}"#,
                r#"{"role": "assistant", "content": "Nothing relevant"}"#,
            ],
        );
        let tool = HistorySearchTool::new(dir.path().to_str().unwrap(), "archives");
        tool.set_context("cli", "direct");
        let out = tool
            .execute(serde_json::json!({"query": "alamo"}))
            .await
            .unwrap();
        assert!(out.contains("Found 1 archived message(s)"));
        assert!(out.contains("[user] Remember the Alamo"));
    }

    #[tokio::test]
    async fn max_results_caps_output() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"role": "user", "content": "topic {i}"}}"#))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        write_archive(dir.path(), "cli:direct", &refs);
        let tool = HistorySearchTool::new(dir.path().to_str().unwrap(), "archives");
        tool.set_context("cli", "direct");
        let out = tool
            .execute(serde_json::json!({"query": "topic", "max_results": 2}))
            .await
            .unwrap();
        assert!(out.contains("Found 2 archived message(s)"));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(
            dir.path(),
            "cli:direct",
            &[
                "not json at all",
                r#"{"role": "user", "content": "valid entry"}"#,
            ],
        );
        let tool = HistorySearchTool::new(dir.path().to_str().unwrap(), "archives");
        tool.set_context("cli", "direct");
        let out = tool
            .execute(serde_json::json!({"query": "valid"}))
            .await
            .unwrap();
        assert!(out.contains("valid entry"));
    }
}
