//! Session types and the persistence contract.
//!
//! A `Session` is the durable record of one conversation, keyed by
//! `channel:chat_id`. Where and how sessions are persisted is an external
//! concern behind the `SessionStore` trait; this crate only ships an
//! in-memory store for tests and embedding.

use crate::error::Error;
use crate::message::{MessageToolCall, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One stored conversation message. Looser than the exchange `Message`:
/// tool calls and call ids are persisted so restarted sessions keep their
/// tool-usage examples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// The durable record of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Conversation key: `channel:chat_id`
    pub key: String,

    /// Ordered messages
    pub messages: Vec<SessionMessage>,

    /// Session-level metadata (compaction summaries, archive counters, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a plain message.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.push(SessionMessage {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        });
    }

    /// Append a message carrying tool-call structure.
    pub fn push(&mut self, message: SessionMessage) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// The most recent `max` messages, oldest first.
    pub fn get_history(&self, max: usize) -> Vec<SessionMessage> {
        let start = self.messages.len().saturating_sub(max);
        self.messages[start..].to_vec()
    }

    /// Wipe all messages, keeping metadata.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }

    /// Rough token estimate (4 chars per token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}

/// Persistence contract for sessions. Implemented externally (files,
/// databases); `InMemorySessionStore` covers tests and embedded use.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the session for `key`, creating an empty one if absent.
    async fn get_or_create(&self, key: &str) -> Session;

    /// Persist a session snapshot.
    async fn save(&self, session: &Session) -> Result<(), Error>;
}

/// Process-local session store. Nothing survives a restart.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, key: &str) -> Session {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
            .clone()
    }

    async fn save(&self, session: &Session) -> Result<(), Error> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.insert(session.key.clone(), session.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_returns_newest_messages() {
        let mut session = Session::new("cli:1");
        for i in 0..10 {
            session.add_message(Role::User, format!("msg {i}"));
        }
        let history = session.get_history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "msg 7");
        assert_eq!(history[2].content, "msg 9");
    }

    #[test]
    fn clear_keeps_metadata() {
        let mut session = Session::new("cli:1");
        session.add_message(Role::User, "hi");
        session
            .metadata
            .insert("summary".into(), serde_json::json!("old topics"));
        session.clear();
        assert!(session.messages.is_empty());
        assert_eq!(session.metadata["summary"], "old topics");
    }

    #[test]
    fn token_estimate() {
        let mut session = Session::new("cli:1");
        // 20 chars ≈ 5 tokens
        session.add_message(Role::User, "12345678901234567890");
        assert_eq!(session.estimated_tokens(), 5);
    }

    #[tokio::test]
    async fn store_roundtrip() {
        let store = InMemorySessionStore::new();
        let mut session = store.get_or_create("cli:1").await;
        assert!(session.messages.is_empty());

        session.add_message(Role::User, "hello");
        store.save(&session).await.unwrap();

        let again = store.get_or_create("cli:1").await;
        assert_eq!(again.messages.len(), 1);
        assert_eq!(again.messages[0].content, "hello");
    }
}
