//! The agent loop: consumes the bus, runs turns, publishes responses.
//!
//! One loop owns everything a running agent needs: the provider (hot-
//! swappable via `/model`), the session store, the extension pipeline, a
//! per-conversation tool registry arena, the subagent manager, and the
//! optional terminal mode. Turn isolation is the load-bearing invariant:
//! any per-message failure is logged, converted into an apology response,
//! and the loop keeps consuming.

use crate::commands::{self, Command, DebugLevel};
use crate::context::{self, ContextBuilder, StaticContextBuilder};
use crate::engine::{run_tool_loop, EngineParams, ToolCallUpdate};
use crate::subagent::{SpawnTool, SubagentManager};
use crate::terminal::run_terminal_command;
use ferrobot_config::{AppConfig, ExecConfig, TerminalConfig};
use ferrobot_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use ferrobot_core::error::Error;
use ferrobot_core::event::{DomainEvent, EventBus};
use ferrobot_core::message::Role;
use ferrobot_core::provider::Provider;
use ferrobot_core::session::{SessionMessage, SessionStore};
use ferrobot_core::tool::{Tool, ToolRegistry};
use ferrobot_extensions::{ExtensionContext, ExtensionManager};
use ferrobot_tools::{ExecTool, FileReadTool, FileWriteTool, HistorySearchTool, MessageTool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Tool results longer than this are truncated when persisted.
const STORED_TOOL_RESULT_LIMIT: usize = 500;

const REGULAR_FALLBACK: &str =
    "I processed your request but wasn't able to generate a text response. \
     Could you try rephrasing or asking again?";

const ANNOUNCE_FALLBACK: &str = "Background task completed.";

/// Tools worth announcing at the `moderate` debug level.
const SLOW_TOOLS: &[&str] = &["exec", "spawn"];

/// Conversations whose registries are kept cached at once. Registries are
/// rebuilt on demand after eviction; context is rebound every turn, so
/// eviction loses nothing.
const REGISTRY_CACHE_LIMIT: usize = 256;

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn Provider>,
    named_providers: HashMap<String, Arc<dyn Provider>>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_iterations: u32,
    max_history: usize,
    model_aliases: HashMap<String, String>,
    store: Arc<dyn SessionStore>,
    context_builder: Box<dyn ContextBuilder>,
    extensions: ExtensionManager,
    /// One registry per conversation, created on first contact. Never
    /// shared across session keys; bounded by `REGISTRY_CACHE_LIMIT`.
    registries: HashMap<String, Arc<ToolRegistry>>,
    /// Per-conversation tool-call visibility, set with `/debug`.
    debug_levels: HashMap<String, DebugLevel>,
    subagents: Arc<SubagentManager>,
    terminal: Option<TerminalConfig>,
    events: Arc<EventBus>,
    workspace: String,
    exec_config: ExecConfig,
    archive_dir: String,
    shutdown: Arc<Notify>,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn Provider>,
        store: Arc<dyn SessionStore>,
        config: &AppConfig,
        workspace: impl Into<String>,
    ) -> Self {
        let workspace = workspace.into();
        let events = Arc::new(EventBus::default());
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            config.default_model.clone(),
            bus.clone(),
            events.clone(),
            workspace.clone(),
            config.exec.clone(),
            config.agent.max_subagents,
            config.agent.max_iterations,
        ));

        Self {
            bus,
            provider,
            named_providers: HashMap::new(),
            model: config.default_model.clone(),
            temperature: config.default_temperature,
            max_tokens: config.default_max_tokens,
            max_iterations: config.agent.max_iterations,
            max_history: config.agent.max_history,
            model_aliases: config.model_aliases.clone(),
            store,
            context_builder: Box::new(StaticContextBuilder::default()),
            extensions: ExtensionManager::new(),
            registries: HashMap::new(),
            debug_levels: HashMap::new(),
            subagents,
            terminal: config.terminal.clone(),
            events,
            workspace,
            exec_config: config.exec.clone(),
            archive_dir: config.compaction.archive_dir.clone(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Replace the extension pipeline.
    pub fn with_extensions(mut self, extensions: ExtensionManager) -> Self {
        self.extensions = extensions;
        self
    }

    /// Replace the context builder.
    pub fn with_context_builder(mut self, builder: Box<dyn ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    /// Make a provider available for `/model` switching under its name
    /// (the prefix of a `provider/model` id).
    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.named_providers.insert(name.into(), provider);
    }

    /// The domain event bus, for subscribers.
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// A handle that makes `run()` return when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consume the bus until shutdown. Every message is handled in full
    /// before the next is dequeued; failures never stop consumption.
    pub async fn run(&mut self) {
        info!(model = %self.model, "Agent loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                msg = self.bus.consume_inbound() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }
        self.subagents.shutdown();
        info!("Agent loop stopped");
    }

    /// Handle one inbound message end to end, publishing whatever should
    /// go out. Never returns an error: turn failures become apology
    /// responses.
    pub async fn handle_message(&mut self, msg: InboundMessage) {
        let preview: String = msg.content.chars().take(80).collect();
        self.events.publish(DomainEvent::MessageReceived {
            channel: msg.channel.clone(),
            sender_id: msg.sender_id.clone(),
            content_preview: preview.clone(),
            timestamp: chrono::Utc::now(),
        });
        info!(
            channel = %msg.channel,
            sender_id = %msg.sender_id,
            preview = %preview,
            "Processing message"
        );

        // Slash commands short-circuit: they never touch the engine.
        if let Some(command) = Command::parse(&msg.content) {
            let reply = match self.dispatch_command(command, &msg).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Command failed");
                    format!("Sorry, I encountered an error: {e}")
                }
            };
            self.bus
                .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, reply));
            return;
        }

        // Terminal mode replaces the engine for the turn; the post hooks
        // and session persistence still run. Subagent announces go through
        // the regular path.
        let outcome = if msg.channel == "system" {
            self.process_system_message(&msg).await
        } else if let Some(terminal) = self.terminal.clone() {
            match self.process_terminal(&msg, &terminal).await {
                Ok(Some(out)) => Ok(out),
                Ok(None) => return,
                Err(e) => Err(e),
            }
        } else {
            self.process_message(&msg).await
        };

        match outcome {
            Ok(out) => self.bus.publish_outbound(out),
            Err(e) => {
                error!(session_key = %msg.session_key(), error = %e, "Turn failed");
                self.events.publish(DomainEvent::TurnFailed {
                    session_key: msg.session_key(),
                    error_message: e.to_string(),
                    timestamp: chrono::Utc::now(),
                });
                self.bus.publish_outbound(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    format!("Sorry, I encountered an error: {e}"),
                ));
            }
        }
    }

    async fn process_message(&mut self, msg: &InboundMessage) -> Result<OutboundMessage, Error> {
        self.run_turn(
            &msg.channel,
            &msg.chat_id,
            &msg.content,
            &msg.media,
            msg.content.clone(),
            REGULAR_FALLBACK,
        )
        .await
    }

    /// A subagent announce: `chat_id` carries `"channel:chat_id"` so the
    /// response routes back to the originating conversation, which also
    /// supplies the session and context.
    async fn process_system_message(
        &mut self,
        msg: &InboundMessage,
    ) -> Result<OutboundMessage, Error> {
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((channel, chat_id)) => (channel.to_string(), chat_id.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };
        info!(sender_id = %msg.sender_id, origin = %format!("{origin_channel}:{origin_chat_id}"), "Processing system message");

        let stored_user = format!("[System: {}] {}", msg.sender_id, msg.content);
        self.run_turn(
            &origin_channel,
            &origin_chat_id,
            &msg.content,
            &[],
            stored_user,
            ANNOUNCE_FALLBACK,
        )
        .await
    }

    /// A terminal-mode turn: the subprocess stands in for the engine, but
    /// the final message still gets `transform_response` and lands in the
    /// session like any other exchange. Transient progress frames are
    /// published by the runner and never persisted.
    async fn process_terminal(
        &mut self,
        msg: &InboundMessage,
        config: &TerminalConfig,
    ) -> Result<Option<OutboundMessage>, Error> {
        let session_key = msg.session_key();
        let mut session = self.store.get_or_create(&session_key).await;

        let ctx = ExtensionContext {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            session_key: session_key.clone(),
            workspace: self.workspace.clone(),
        };

        let out = run_terminal_command(msg, config, &self.workspace, &self.bus).await;

        session.add_message(Role::User, msg.content.clone());
        let out = match out {
            Some(mut out) => {
                out.content = self
                    .extensions
                    .transform_response(out.content, &ctx)
                    .await?;
                session.add_message(Role::Assistant, out.content.clone());
                Some(out)
            }
            None => None,
        };

        self.extensions.pre_session_save(&mut session, &ctx).await?;
        self.store.save(&session).await?;
        Ok(out)
    }

    async fn run_turn(
        &mut self,
        channel: &str,
        chat_id: &str,
        content: &str,
        media: &[String],
        stored_user: String,
        fallback: &str,
    ) -> Result<OutboundMessage, Error> {
        let session_key = format!("{channel}:{chat_id}");
        let mut session = self.store.get_or_create(&session_key).await;

        let registry = self.registry_for(&session_key);
        registry.set_context(channel, chat_id);

        let ctx = ExtensionContext {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            session_key: session_key.clone(),
            workspace: self.workspace.clone(),
        };

        let history = context::history_to_messages(&session.get_history(self.max_history));
        let history = self
            .extensions
            .transform_history(history, &mut session, &ctx)
            .await?;

        let mut messages = self.context_builder.build_messages(history, content, media);
        messages = self.extensions.transform_messages(messages, &ctx).await?;
        context::maybe_nudge_tool_use(&mut messages);

        let debug_level = self
            .debug_levels
            .get(&session_key)
            .copied()
            .unwrap_or_default();
        let progress_bus = self.bus.clone();
        let (progress_channel, progress_chat) = (channel.to_string(), chat_id.to_string());
        let observer = move |update: ToolCallUpdate<'_>| {
            if let Some(text) = progress_text(debug_level, &update) {
                progress_bus.publish_outbound(
                    OutboundMessage::new(&progress_channel, &progress_chat, text).transient(),
                );
            }
        };

        let pre_loop_len = messages.len();
        let result = run_tool_loop(
            EngineParams {
                provider: self.provider.as_ref(),
                tools: &registry,
                model: &self.model,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                max_iterations: self.max_iterations,
                session_key: &session_key,
                events: &self.events,
                on_tool_call: Some(&observer),
            },
            &mut messages,
        )
        .await?;

        let final_content = if result.text.is_empty() {
            fallback.to_string()
        } else {
            result.text
        };
        let final_content = self
            .extensions
            .transform_response(final_content, &ctx)
            .await?;

        // Persist the turn: real tool_call structures survive so restarted
        // sessions keep their tool-usage examples; bulky tool results are
        // truncated.
        session.add_message(Role::User, stored_user);
        for m in &messages[pre_loop_len..] {
            let mut stored = m.content.clone();
            if m.tool_call_id.is_some() && stored.chars().count() > STORED_TOOL_RESULT_LIMIT {
                let truncated: String = stored.chars().take(STORED_TOOL_RESULT_LIMIT).collect();
                stored = format!("{truncated}\n...(truncated)");
            }
            session.push(SessionMessage {
                role: m.role,
                content: stored,
                tool_calls: m.tool_calls.clone(),
                tool_call_id: m.tool_call_id.clone(),
                name: m.name.clone(),
                timestamp: chrono::Utc::now(),
            });
        }
        session.add_message(Role::Assistant, final_content.clone());

        self.extensions.pre_session_save(&mut session, &ctx).await?;
        self.store.save(&session).await?;

        let preview: String = final_content.chars().take(120).collect();
        info!(session_key = %session_key, iterations = result.iterations, preview = %preview, "Turn complete");

        Ok(OutboundMessage::new(channel, chat_id, final_content))
    }

    /// The registry for a conversation, created lazily on first contact.
    /// At the cache limit the arena is dropped wholesale; entries rebuild
    /// on next contact.
    fn registry_for(&mut self, session_key: &str) -> Arc<ToolRegistry> {
        if let Some(registry) = self.registries.get(session_key) {
            return registry.clone();
        }
        if self.registries.len() >= REGISTRY_CACHE_LIMIT {
            info!(
                limit = REGISTRY_CACHE_LIMIT,
                "Registry cache full, evicting all conversations"
            );
            self.registries.clear();
        }
        let registry = Arc::new(self.build_registry());
        self.registries
            .insert(session_key.to_string(), registry.clone());
        registry
    }

    fn build_registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ExecTool::new(&self.exec_config)),
            Arc::new(FileReadTool::new()),
            Arc::new(FileWriteTool::new()),
            Arc::new(MessageTool::new(self.bus.clone())),
            Arc::new(HistorySearchTool::new(&self.workspace, &self.archive_dir)),
            Arc::new(SpawnTool::new(self.subagents.clone())),
        ];
        for tool in tools {
            // Fixed set, fresh registry: collisions are impossible.
            if let Err(e) = registry.register(tool) {
                warn!(error = %e, "Tool registration skipped");
            }
        }
        registry
    }

    async fn dispatch_command(
        &mut self,
        command: Command,
        msg: &InboundMessage,
    ) -> Result<String, Error> {
        match command {
            Command::Model { target: None } => Ok(self.model_status()),
            Command::Model {
                target: Some(target),
            } => {
                let model = commands::resolve_model(&target, &self.model_aliases);
                let provider_name = model.split('/').next().unwrap_or(model.as_str());
                if let Some(provider) = self.named_providers.get(provider_name) {
                    self.provider = provider.clone();
                    self.model = model.clone();
                    self.subagents.set_provider(provider.clone(), &model);
                    info!(model = %model, provider = provider_name, "Switched model");
                    Ok(format!("Switched to `{model}`"))
                } else {
                    self.model = model.clone();
                    self.subagents
                        .set_provider(self.provider.clone(), &model);
                    info!(model = %model, "Switched model on current provider");
                    Ok(format!("Switched to `{model}` (provider unchanged)"))
                }
            }
            Command::Clear => {
                let mut session = self.store.get_or_create(&msg.session_key()).await;
                let count = session.messages.len();
                session.clear();
                self.store.save(&session).await?;
                Ok(format!("Session cleared ({count} messages removed)."))
            }
            Command::Session => {
                let session = self.store.get_or_create(&msg.session_key()).await;
                let archived = session
                    .metadata
                    .get("archived_count")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                let archived_note = if archived > 0 {
                    format!(" (+ {archived} archived)")
                } else {
                    String::new()
                };
                Ok([
                    format!("Session: `{}`", session.key),
                    format!("Messages: {}{archived_note}", session.messages.len()),
                    format!("Estimated tokens: ~{}", session.estimated_tokens()),
                    format!("Created: {}", session.created_at.format("%Y-%m-%d %H:%M")),
                    format!("Updated: {}", session.updated_at.format("%Y-%m-%d %H:%M")),
                ]
                .join("\n"))
            }
            Command::Debug { level: None } => {
                let current = self
                    .debug_levels
                    .get(&msg.session_key())
                    .copied()
                    .unwrap_or_default();
                Ok(format!(
                    "Debug level: `{}`\nOptions: `all`, `moderate`, `none`",
                    current.as_str()
                ))
            }
            Command::Debug { level: Some(level) } => match DebugLevel::parse(&level) {
                Some(parsed) => {
                    self.debug_levels.insert(msg.session_key(), parsed);
                    Ok(format!("Debug level set to `{}`", parsed.as_str()))
                }
                None => Ok("Usage: `/debug all|moderate|none`".to_string()),
            },
            Command::Undo => {
                let mut session = self.store.get_or_create(&msg.session_key()).await;
                if session.messages.is_empty() {
                    return Ok("Session is empty, nothing to undo.".to_string());
                }
                let mut removed = 0;
                while session
                    .messages
                    .last()
                    .is_some_and(|m| matches!(m.role, Role::Assistant | Role::Tool))
                {
                    session.messages.pop();
                    removed += 1;
                }
                if session.messages.last().is_some_and(|m| m.role == Role::User) {
                    session.messages.pop();
                    removed += 1;
                }
                self.store.save(&session).await?;
                Ok(format!("Undone last exchange ({removed} messages removed)."))
            }
            Command::Retry => {
                let mut session = self.store.get_or_create(&msg.session_key()).await;
                if session.messages.is_empty() {
                    return Ok("Session is empty, nothing to retry.".to_string());
                }
                while session
                    .messages
                    .last()
                    .is_some_and(|m| matches!(m.role, Role::Assistant | Role::Tool))
                {
                    session.messages.pop();
                }
                let last_user = if session.messages.last().is_some_and(|m| m.role == Role::User)
                {
                    session.messages.pop().map(|m| m.content)
                } else {
                    None
                };
                self.store.save(&session).await?;
                match last_user {
                    Some(content) => {
                        self.bus.publish_inbound(InboundMessage::new(
                            &msg.channel,
                            &msg.sender_id,
                            &msg.chat_id,
                            content,
                        ));
                        Ok("Retrying last message...".to_string())
                    }
                    None => Ok("Could not find a user message to retry.".to_string()),
                }
            }
            Command::Help => Ok(commands::help_text()),
        }
    }

    fn model_status(&self) -> String {
        let mut lines = vec![format!("Current model: `{}`", self.model), String::new()];
        if !self.model_aliases.is_empty() {
            lines.push("Available aliases:".to_string());
            let mut aliases: Vec<_> = self.model_aliases.iter().collect();
            aliases.sort();
            for (alias, model) in aliases {
                lines.push(format!("  /model {alias} -> `{model}`"));
            }
            lines.push(String::new());
        }
        lines.push("Or use an explicit model id: `/model provider/model-id`".to_string());
        lines.join("\n")
    }
}

/// User-facing text for a tool-call progress update, or `None` when the
/// visibility level keeps it quiet.
fn progress_text(level: DebugLevel, update: &ToolCallUpdate<'_>) -> Option<String> {
    if level == DebugLevel::None {
        return None;
    }
    match update {
        ToolCallUpdate::Heartbeat { elapsed_secs, .. } => {
            let (mins, secs) = (elapsed_secs / 60, elapsed_secs % 60);
            let label = if mins > 0 {
                format!("{mins}m{secs}s")
            } else {
                format!("{secs}s")
            };
            Some(format!("⏳ Still running... ({label})"))
        }
        ToolCallUpdate::Started { name, arguments } => match level {
            DebugLevel::All => {
                let args = arguments
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(key, value)| {
                                let mut value = value.to_string();
                                if value.chars().count() > 80 {
                                    let short: String = value.chars().take(80).collect();
                                    value = format!("{short}...");
                                }
                                format!("{key}={value}")
                            })
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                Some(format!("🔧 `{name}({args})`"))
            }
            DebugLevel::Moderate => {
                if !SLOW_TOOLS.contains(name) {
                    return None;
                }
                let detail = match *name {
                    "exec" => arguments.get("command"),
                    _ => arguments.get("task"),
                }
                .and_then(|v| v.as_str())
                .unwrap_or("");
                Some(format!("⏳ `{name}`: {detail}"))
            }
            DebugLevel::None => None,
        },
    }
}
