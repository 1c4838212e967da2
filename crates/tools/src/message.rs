//! Tool that lets the model send a message before the turn finishes.

use async_trait::async_trait;
use ferrobot_core::bus::{MessageBus, OutboundMessage};
use ferrobot_core::error::ToolError;
use ferrobot_core::tool::Tool;
use std::sync::{Arc, Mutex};

/// Publishes an `OutboundMessage` for the conversation this tool is bound
/// to via `set_context`. The final turn response still goes out through the
/// normal path; this is for intermediate updates.
pub struct MessageTool {
    bus: Arc<MessageBus>,
    context: Mutex<(String, String)>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            context: Mutex::new((String::new(), String::new())),
        }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user immediately, before your turn is over. \
         Useful for progress updates during long-running work."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message text to send"
                }
            },
            "required": ["content"]
        })
    }

    fn supports_context(&self) -> bool {
        true
    }

    fn set_context(&self, channel: &str, chat_id: &str) {
        let mut guard = match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = (channel.to_string(), chat_id.to_string());
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let (channel, chat_id) = match self.context.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if channel.is_empty() || chat_id.is_empty() {
            return Err(ToolError::ExecutionFailed {
                tool_name: "message".into(),
                reason: "no conversation context bound".into(),
            });
        }

        self.bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, content));
        Ok("Message sent.".into())
    }
}
