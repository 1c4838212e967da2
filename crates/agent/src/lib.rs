//! The Ferrobot agent runtime.
//!
//! This crate ties the domain types from `ferrobot-core` into a running
//! agent: the turn engine (`engine`) drives the model/tool loop, the agent
//! loop (`loop_runner`) consumes the message bus and owns per-conversation
//! state, subagents (`subagent`) run delegated background tasks, slash
//! commands (`commands`) intercept control messages, and terminal mode
//! (`terminal`) delegates whole turns to an external subprocess.

pub mod commands;
pub mod context;
pub mod engine;
pub mod loop_runner;
pub mod subagent;
pub mod terminal;

pub use context::{ContextBuilder, StaticContextBuilder};
pub use engine::{
    run_tool_loop, EngineParams, ToolCallObserver, ToolCallUpdate, TurnResult, TurnStatus,
};
pub use loop_runner::AgentLoop;
pub use subagent::{SpawnTool, SubagentManager};
pub use terminal::run_terminal_command;
