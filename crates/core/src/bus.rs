//! The message bus: two independent FIFO queues connecting front-end
//! adapters to the agent loop without direct references between them.
//!
//! Queue policy: unbounded `tokio::sync::mpsc` channels. Publishing never
//! blocks; consuming awaits the next message. The queues are process-local
//! and not durable; a crash loses unconsumed messages. That is a documented
//! limitation, not a bug to fix here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// A message received from a chat front-end, headed for the agent loop.
///
/// Immutable once enqueued; consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Source channel name (e.g. "telegram", "cli", or "system" for
    /// subagent announces)
    pub channel: String,

    /// Platform-specific sender identifier
    pub sender_id: String,

    /// The chat/group/DM identifier within the channel
    pub chat_id: String,

    /// The text content
    pub content: String,

    /// Ordered list of media file paths attached to the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,

    /// When the message was accepted onto the bus
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// The conversation key: unit of session identity and ordering.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// A response headed for a chat front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination channel name
    pub channel: String,

    /// Destination chat identifier
    pub chat_id: String,

    /// The text content
    pub content: String,

    /// Media file paths to deliver alongside the text
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,

    /// Transient messages (e.g. terminal progress frames) are delivered but
    /// never persisted to conversation history.
    #[serde(default)]
    pub transient: bool,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            transient: false,
        }
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Two independent FIFO queues: many producers, a consuming loop on each
/// side, no direct references between them.
///
/// Receivers sit behind async mutexes so the bus itself can be shared via
/// `Arc`. FIFO order is global per queue, not per conversation.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Enqueue a message from a front-end adapter. Never blocks.
    pub fn publish_inbound(&self, msg: InboundMessage) {
        debug!(channel = %msg.channel, chat_id = %msg.chat_id, "Inbound enqueued");
        // Send only fails when the receiver is gone, i.e. the bus is being
        // torn down. Nothing useful to do with the message then.
        let _ = self.inbound_tx.send(msg);
    }

    /// Enqueue a response for a front-end adapter. Never blocks.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        debug!(channel = %msg.channel, chat_id = %msg.chat_id, "Outbound enqueued");
        let _ = self.outbound_tx.send(msg);
    }

    /// Dequeue the next inbound message, FIFO. Awaits until one arrives;
    /// returns `None` only when all producers have been dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Dequeue the next outbound message, FIFO.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Non-blocking outbound dequeue, for adapters that poll.
    pub async fn try_consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.try_recv().ok()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
