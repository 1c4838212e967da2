//! Prompt assembly: system prompt + prior history + the new user message.

use ferrobot_core::message::{Message, Role};
use ferrobot_core::session::SessionMessage;

/// Builds the message list sent to the model each turn. The default is
/// `StaticContextBuilder`; embedders can swap in their own (skills,
/// retrieval, per-channel personas).
pub trait ContextBuilder: Send + Sync {
    /// The system prompt for this agent.
    fn system_prompt(&self) -> String;

    /// Assemble the full exchange: system prompt, transformed history, and
    /// the current user message (with an attachment note when media is
    /// present).
    fn build_messages(
        &self,
        history: Vec<Message>,
        current_message: &str,
        media: &[String],
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.system_prompt()));
        messages.extend(history);

        let content = if media.is_empty() {
            current_message.to_string()
        } else {
            format!(
                "{current_message}\n[Attached media: {}]",
                media.join(", ")
            )
        };
        messages.push(Message::user(content));
        messages
    }
}

/// A fixed-prompt context builder.
pub struct StaticContextBuilder {
    system_prompt: String,
}

impl StaticContextBuilder {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }
}

impl Default for StaticContextBuilder {
    fn default() -> Self {
        Self::new(
            "You are a helpful agent. Use your tools when a request requires \
             reading files, running commands, or any action beyond pure \
             conversation.",
        )
    }
}

impl ContextBuilder for StaticContextBuilder {
    fn system_prompt(&self) -> String {
        self.system_prompt.clone()
    }
}

/// Convert stored session messages into exchange messages, keeping
/// tool-call structure so the model sees prior tool usage.
pub fn history_to_messages(history: &[SessionMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|m| Message {
            role: m.role,
            content: m.content.clone(),
            tool_calls: m.tool_calls.clone(),
            tool_call_id: m.tool_call_id.clone(),
            name: m.name.clone(),
        })
        .collect()
}

/// Insert a tool-use reminder before the final user message when the
/// history shows no tool calls at all. Covers brand-new sessions and
/// sessions saved before tool-call persistence; becomes a no-op as soon
/// as real tool calls appear.
pub fn maybe_nudge_tool_use(messages: &mut Vec<Message>) {
    // Need meaningful history: system + at least 2 history msgs + current user.
    if messages.len() < 4 {
        return;
    }
    if messages
        .iter()
        .any(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
    {
        return;
    }
    let nudge = Message::system(
        "[System: You have tools available (file I/O, shell, etc.). When the \
         user's request requires reading files, running commands, or any \
         action beyond pure conversation, you MUST call the appropriate tool \
         rather than responding with text only.]",
    );
    messages.insert(messages.len() - 1, nudge);
}
