//! Slash commands: control messages intercepted before the engine.
//!
//! Parsing is pure; dispatch (which needs loop state) lives on `AgentLoop`.
//! Unknown `/something` text parses to `None` and falls through to the
//! model as an ordinary message.

use std::collections::HashMap;

/// A recognized slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/model` shows status; `/model <alias|id>` hot-swaps.
    Model { target: Option<String> },
    /// `/clear` wipes the session history.
    Clear,
    /// `/session` shows session stats.
    Session,
    /// `/debug` shows the visibility level; `/debug <level>` sets it.
    Debug { level: Option<String> },
    /// `/undo` removes the last user/assistant exchange.
    Undo,
    /// `/retry` undoes the last exchange and re-sends the user message.
    Retry,
    /// `/help` lists commands.
    Help,
}

impl Command {
    /// Parse a message as a slash command. Returns `None` for ordinary
    /// text and for unrecognized command names.
    pub fn parse(text: &str) -> Option<Command> {
        let rest = text.trim().strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        match name {
            "model" => Some(Command::Model {
                target: (!args.is_empty()).then(|| args.to_string()),
            }),
            "clear" => Some(Command::Clear),
            "session" => Some(Command::Session),
            "debug" => Some(Command::Debug {
                level: (!args.is_empty()).then(|| args.to_string()),
            }),
            "undo" => Some(Command::Undo),
            "retry" => Some(Command::Retry),
            "help" => Some(Command::Help),
            _ => None,
        }
    }
}

/// How much mid-turn tool-call activity is surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    /// Every tool call, with arguments.
    All,
    /// Slow tools and heartbeats only.
    #[default]
    Moderate,
    /// No progress notifications.
    None,
}

impl DebugLevel {
    pub fn parse(level: &str) -> Option<Self> {
        match level.to_lowercase().as_str() {
            "all" => Some(Self::All),
            "moderate" => Some(Self::Moderate),
            "none" => Some(Self::None),
            _ => Option::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Moderate => "moderate",
            Self::None => "none",
        }
    }
}

/// Resolve a `/model` target through the configured aliases. Alias lookup
/// is case-insensitive; anything unmatched is taken as an explicit model
/// id.
pub fn resolve_model(target: &str, aliases: &HashMap<String, String>) -> String {
    aliases
        .get(&target.to_lowercase())
        .cloned()
        .unwrap_or_else(|| target.to_string())
}

pub fn help_text() -> String {
    [
        "Available commands:",
        "  /model [alias|id] - show or switch the LLM model",
        "  /clear - wipe session history",
        "  /session - show session stats",
        "  /debug [all|moderate|none] - set tool-call visibility",
        "  /undo - remove the last exchange",
        "  /retry - re-send your last message",
        "  /help - list available commands",
    ]
    .join("\n")
}
