//! Extension hook pipeline.
//!
//! Extensions observe and mutate a message exchange at four fixed points in
//! a turn's lifecycle without the core knowing they exist. The pipeline is
//! an ordered list: extension *n*'s output is extension *n+1*'s input, a
//! strict left-to-right fold. A no-op hook returns its input unchanged.
//!
//! Failure policy: a hook that returns `Err` aborts the current turn only.
//! The agent loop reports it as a turn-level error and keeps consuming.
//! The core imposes no timeout on hooks; an extension that hangs stalls
//! that conversation's turn (documented risk).
//!
//! Registration is static: extensions are constructed and pushed onto the
//! manager at startup, in configuration order.

pub mod compaction;

pub use compaction::CompactionExtension;

use async_trait::async_trait;
use ferrobot_core::error::ExtensionError;
use ferrobot_core::message::Message;
use ferrobot_core::session::Session;
use tracing::info;

/// Context passed by value to every hook call in a turn.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub workspace: String,
}

/// The four-hook extension interface. Override only the hooks you need;
/// every default is the identity transformation.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Extension name, for logs and error attribution.
    fn name(&self) -> &str;

    /// One-time initialization from configuration options.
    async fn on_load(&mut self, _options: &serde_json::Value) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Reorder, drop, or annotate prior turns before prompt assembly.
    async fn transform_history(
        &self,
        history: Vec<Message>,
        _session: &mut Session,
        _ctx: &ExtensionContext,
    ) -> Result<Vec<Message>, ExtensionError> {
        Ok(history)
    }

    /// Last chance to edit the exact payload sent to the model.
    async fn transform_messages(
        &self,
        messages: Vec<Message>,
        _ctx: &ExtensionContext,
    ) -> Result<Vec<Message>, ExtensionError> {
        Ok(messages)
    }

    /// Post-process the model's final answer before it is shown/persisted.
    async fn transform_response(
        &self,
        content: String,
        _ctx: &ExtensionContext,
    ) -> Result<String, ExtensionError> {
        Ok(content)
    }

    /// Last chance to mutate persisted state before a session write.
    async fn pre_session_save(
        &self,
        _session: &mut Session,
        _ctx: &ExtensionContext,
    ) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// Runs registered extensions through the pipeline hooks in order.
pub struct ExtensionManager {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self {
            extensions: Vec::new(),
        }
    }

    /// Append an extension to the pipeline. Order of registration is
    /// pipeline order.
    pub fn register(&mut self, extension: Box<dyn Extension>) {
        info!(extension = extension.name(), "Extension registered");
        self.extensions.push(extension);
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub async fn transform_history(
        &self,
        mut history: Vec<Message>,
        session: &mut Session,
        ctx: &ExtensionContext,
    ) -> Result<Vec<Message>, ExtensionError> {
        for ext in &self.extensions {
            history = ext.transform_history(history, session, ctx).await?;
        }
        Ok(history)
    }

    pub async fn transform_messages(
        &self,
        mut messages: Vec<Message>,
        ctx: &ExtensionContext,
    ) -> Result<Vec<Message>, ExtensionError> {
        for ext in &self.extensions {
            messages = ext.transform_messages(messages, ctx).await?;
        }
        Ok(messages)
    }

    pub async fn transform_response(
        &self,
        mut content: String,
        ctx: &ExtensionContext,
    ) -> Result<String, ExtensionError> {
        for ext in &self.extensions {
            content = ext.transform_response(content, ctx).await?;
        }
        Ok(content)
    }

    pub async fn pre_session_save(
        &self,
        session: &mut Session,
        ctx: &ExtensionContext,
    ) -> Result<(), ExtensionError> {
        for ext in &self.extensions {
            ext.pre_session_save(session, ctx).await?;
        }
        Ok(())
    }
}

impl Default for ExtensionManager {
    fn default() -> Self {
        Self::new()
    }
}
