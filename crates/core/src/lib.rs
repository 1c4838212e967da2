//! # Ferrobot Core
//!
//! Domain types, traits, and error definitions for the Ferrobot agent
//! runtime. This crate has **zero framework dependencies**; it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is defined as a trait here: the LLM backend
//! (`Provider`), chat front-ends (`Channel`), conversation persistence
//! (`SessionStore`), and agent capabilities (`Tool`). Implementations live in
//! their respective crates; or outside the workspace entirely. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod bus;
pub mod channel;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use channel::Channel;
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use tool::{Tool, ToolRegistry};
