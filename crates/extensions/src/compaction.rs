//! Session compaction extension: archives old messages and injects
//! summaries.
//!
//! When a session grows past 1.5× the active-message budget, everything but
//! the newest messages is appended to a per-session JSONL archive under the
//! workspace, and a plain-text summary (no LLM call) is stored in the
//! session metadata. The summary is re-injected at the head of the history
//! on subsequent turns, and the archive is searchable through the
//! `history_search` tool.

use crate::{Extension, ExtensionContext};
use async_trait::async_trait;
use ferrobot_config::CompactionConfig;
use ferrobot_core::error::ExtensionError;
use ferrobot_core::message::Message;
use ferrobot_core::session::{Session, SessionMessage};
use ferrobot_core::Role;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Metadata keys written by this extension.
const KEY_SUMMARY: &str = "compaction_summary";
const KEY_ARCHIVE_PATH: &str = "archive_path";
const KEY_ARCHIVED_COUNT: &str = "archived_count";

pub struct CompactionExtension {
    max_active_messages: usize,
    archive_dir: String,
}

impl CompactionExtension {
    pub fn new(config: &CompactionConfig) -> Self {
        Self {
            max_active_messages: config.max_active_messages,
            archive_dir: config.archive_dir.clone(),
        }
    }

    /// Archive file for a session: `{workspace}/{archive_dir}/{key}.jsonl`
    /// with the key made filesystem-safe.
    pub fn archive_path(workspace: &str, archive_dir: &str, session_key: &str) -> PathBuf {
        Path::new(workspace)
            .join(archive_dir)
            .join(format!("{}.jsonl", safe_filename(session_key)))
    }

    fn build_summary(archived: &[SessionMessage], prev_summary: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(prev) = prev_summary {
            parts.push(truncate_chars(prev, 300).trim_end().to_string());
        }

        // Sample up to 5 user messages spread across the archived range as
        // topic markers.
        let user_msgs: Vec<&SessionMessage> = archived
            .iter()
            .filter(|m| m.role == Role::User)
            .collect();
        let step = (user_msgs.len() / 5).max(1);
        let topics: Vec<String> = user_msgs
            .iter()
            .step_by(step)
            .take(5)
            .filter_map(|m| {
                let line = m.content.trim().lines().next().unwrap_or("");
                if line.is_empty() {
                    None
                } else {
                    Some(format!("- {}", truncate_chars(line, 200)))
                }
            })
            .collect();
        if !topics.is_empty() {
            parts.push(format!("Topics discussed:\n{}", topics.join("\n")));
        }

        // Last archived exchange
        let last_user = archived.iter().rev().find(|m| m.role == Role::User);
        let last_assistant = archived.iter().rev().find(|m| m.role == Role::Assistant);
        if let (Some(u), Some(a)) = (last_user, last_assistant) {
            parts.push(format!(
                "Last archived exchange:\nUser: {}\nAssistant: {}",
                truncate_chars(&u.content, 200),
                truncate_chars(&a.content, 200),
            ));
        }

        truncate_chars(&parts.join("\n\n"), 1000)
    }
}

#[async_trait]
impl Extension for CompactionExtension {
    fn name(&self) -> &str {
        "compaction"
    }

    async fn on_load(&mut self, options: &serde_json::Value) -> Result<(), ExtensionError> {
        if let Some(max) = options.get("max_active_messages").and_then(|v| v.as_u64()) {
            self.max_active_messages = max as usize;
        }
        if let Some(dir) = options.get("archive_dir").and_then(|v| v.as_str()) {
            self.archive_dir = dir.to_string();
        }
        Ok(())
    }

    /// Prepend the stored summary to history if one exists.
    async fn transform_history(
        &self,
        history: Vec<Message>,
        session: &mut Session,
        _ctx: &ExtensionContext,
    ) -> Result<Vec<Message>, ExtensionError> {
        let Some(summary) = session.metadata.get(KEY_SUMMARY).and_then(|v| v.as_str()) else {
            return Ok(history);
        };

        let mut out = Vec::with_capacity(history.len() + 1);
        out.push(Message::user(format!(
            "[Context from earlier conversation:\n{summary}]"
        )));
        out.extend(history);
        Ok(out)
    }

    /// Archive old messages when the session exceeds the threshold.
    async fn pre_session_save(
        &self,
        session: &mut Session,
        ctx: &ExtensionContext,
    ) -> Result<(), ExtensionError> {
        let threshold = self.max_active_messages + self.max_active_messages / 2;
        if session.messages.len() <= threshold {
            return Ok(());
        }

        let split = session.messages.len() - self.max_active_messages;
        let archived: Vec<SessionMessage> = session.messages.drain(..split).collect();

        let path = Self::archive_path(&ctx.workspace, &self.archive_dir, &session.key);
        let io_err = |e: std::io::Error| ExtensionError {
            extension: "compaction".into(),
            hook: "pre_session_save".into(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut lines = String::new();
        for msg in &archived {
            let line = serde_json::to_string(msg).map_err(|e| ExtensionError {
                extension: "compaction".into(),
                hook: "pre_session_save".into(),
                reason: e.to_string(),
            })?;
            lines.push_str(&line);
            lines.push('\n');
        }
        // Append, never rewrite: the archive is a running log.
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(lines.as_bytes()).await.map_err(io_err)?;

        let prev_summary = session
            .metadata
            .get(KEY_SUMMARY)
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let summary = Self::build_summary(&archived, prev_summary.as_deref());

        let prev_count = session
            .metadata
            .get(KEY_ARCHIVED_COUNT)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = prev_count + archived.len() as u64;

        session
            .metadata
            .insert(KEY_SUMMARY.into(), serde_json::json!(summary));
        session.metadata.insert(
            KEY_ARCHIVE_PATH.into(),
            serde_json::json!(path.to_string_lossy()),
        );
        session
            .metadata
            .insert(KEY_ARCHIVED_COUNT.into(), serde_json::json!(total));

        info!(
            session = %session.key,
            archived = archived.len(),
            kept = session.messages.len(),
            total_archived = total,
            "Compacted session"
        );
        Ok(())
    }
}

/// Make a session key safe for use as a file name.
fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Character-boundary-safe truncation.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
