//! Built-in tool implementations for Ferrobot.
//!
//! Every tool implements `ferrobot_core::tool::Tool`. Tools are registered
//! into a per-conversation `ToolRegistry` by the agent loop; subagents get
//! a reduced set built from scratch (see `ferrobot-agent`).

pub mod file_read;
pub mod file_write;
pub mod history;
pub mod message;
pub mod shell;

pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use history::HistorySearchTool;
pub use message::MessageTool;
pub use shell::ExecTool;
