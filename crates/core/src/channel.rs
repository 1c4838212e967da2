//! Channel trait: the contract for chat front-end adapters.
//!
//! Adapters (Telegram, Discord, CLI, webhooks) live outside this workspace.
//! They publish accepted messages onto the bus and deliver outbound
//! messages back to their platform; this trait is the full surface the
//! core relies on.

use crate::bus::OutboundMessage;
use crate::error::ChannelError;
use async_trait::async_trait;

/// The front-end adapter contract.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "cli"). Matches the `channel` field
    /// on bus messages.
    fn name(&self) -> &str;

    /// Start listening for incoming messages. The adapter handles polling,
    /// webhooks, or gateway connections internally and publishes accepted
    /// messages to the bus.
    async fn start(&self) -> std::result::Result<(), ChannelError>;

    /// Stop the channel gracefully.
    async fn stop(&self) -> std::result::Result<(), ChannelError>;

    /// Deliver an outbound message to the platform.
    async fn send(&self, msg: &OutboundMessage) -> std::result::Result<(), ChannelError>;

    /// Allowlist check. Adapters must call this before anything reaches
    /// the bus.
    fn is_allowed(&self, sender_id: &str) -> bool;
}
