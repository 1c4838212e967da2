//! The turn engine: one model/tool loop shared by the agent and subagents.
//!
//! Given a provider, a tool registry, and a mutable message list, the loop
//! calls the model, executes any requested tool calls, appends the paired
//! results, and repeats until the model answers with plain text or the
//! iteration cap is hit. Within a turn the message list is append-only.
//!
//! Terminal states: `Completed` (text answer), `IterationCap` (cap reached,
//! canned text), or the `Err` arm (provider failure; never retried here;
//! retry policy belongs to provider implementations).

use ferrobot_core::error::ProviderError;
use ferrobot_core::event::{DomainEvent, EventBus};
use ferrobot_core::message::{Message, MessageToolCall};
use ferrobot_core::provider::{Provider, ProviderRequest};
use ferrobot_core::tool::ToolRegistry;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

const ITERATION_CAP_TEXT: &str =
    "I've reached the maximum number of tool call iterations. \
     Please provide further guidance.";

const EMPTY_RESPONSE_NUDGE: &str =
    "[System: Your previous response was empty. Please provide a summary \
     of what you did or respond to the user's message.]";

/// Seconds between "still running" notifications for a slow tool call.
const HEARTBEAT_SECS: u64 = 30;

/// A mid-turn progress notification about tool execution.
#[derive(Debug)]
pub enum ToolCallUpdate<'a> {
    /// A tool is about to execute.
    Started {
        name: &'a str,
        arguments: &'a serde_json::Value,
    },
    /// A tool has been running for `elapsed_secs` and is still going.
    Heartbeat { name: &'a str, elapsed_secs: u64 },
}

/// Observer invoked synchronously for each [`ToolCallUpdate`].
pub type ToolCallObserver<'a> = &'a (dyn Fn(ToolCallUpdate<'_>) + Send + Sync);

/// How a turn ended. A provider failure is the `Err` arm of
/// `run_tool_loop`, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model produced a final text response.
    Completed,
    /// The iteration cap was reached before a text response.
    IterationCap,
}

/// Outcome of one engine run.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub text: String,
    pub iterations: u32,
    pub status: TurnStatus,
}

/// Everything the engine needs besides the message list.
pub struct EngineParams<'a> {
    pub provider: &'a dyn Provider,
    pub tools: &'a ToolRegistry,
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    pub session_key: &'a str,
    pub events: &'a EventBus,
    /// Fired before each tool execution and periodically while a slow
    /// call is still running.
    pub on_tool_call: Option<ToolCallObserver<'a>>,
}

/// Run the model/tool loop over `messages` until a terminal state.
///
/// Tool calls within one assistant message execute concurrently; results
/// are appended in request order, each paired to its call id. Tool
/// failures never abort the turn; they come back as `"Error: ..."` tool
/// results for the model to observe.
pub async fn run_tool_loop(
    params: EngineParams<'_>,
    messages: &mut Vec<Message>,
) -> Result<TurnResult, ProviderError> {
    let mut empty_retries = 0u32;

    for iteration in 1..=params.max_iterations {
        debug!(
            session_key = params.session_key,
            iteration, "Engine iteration"
        );

        let request = ProviderRequest {
            model: params.model.to_string(),
            messages: messages.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            tools: params.tools.definitions(),
        };

        let response = params.provider.chat(request).await?;

        if let Some(usage) = &response.usage {
            params.events.publish(DomainEvent::ResponseGenerated {
                session_key: params.session_key.to_string(),
                model: response.model.clone(),
                tokens_used: usage.total_tokens,
                timestamp: chrono::Utc::now(),
            });
        }

        if response.message.tool_calls.is_empty() {
            // Some models return empty content with no tool calls; nudge
            // once, then accept whatever comes back.
            if response.message.content.is_empty() && empty_retries < 1 {
                empty_retries += 1;
                warn!(
                    session_key = params.session_key,
                    "Empty response with no tool calls, retrying once"
                );
                messages.push(Message::assistant(""));
                messages.push(Message::user(EMPTY_RESPONSE_NUDGE));
                continue;
            }
            // The final text is NOT appended here: the caller persists it
            // after transform_response has run.
            return Ok(TurnResult {
                text: response.message.content,
                iterations: iteration,
                status: TurnStatus::Completed,
            });
        }

        let tool_calls = response.message.tool_calls.clone();
        messages.push(response.message);

        info!(
            session_key = params.session_key,
            count = tool_calls.len(),
            "Executing tool calls"
        );
        for result in execute_calls(params.tools, &tool_calls, params.on_tool_call).await {
            params.events.publish(DomainEvent::ToolExecuted {
                tool_name: result.name.clone(),
                success: result.success,
                duration_ms: result.duration_ms,
                timestamp: chrono::Utc::now(),
            });
            messages.push(Message::tool_result(result.id, result.name, result.output));
        }
    }

    warn!(
        session_key = params.session_key,
        max_iterations = params.max_iterations,
        "Iteration cap reached without a text response"
    );
    Ok(TurnResult {
        text: ITERATION_CAP_TEXT.to_string(),
        iterations: params.max_iterations,
        status: TurnStatus::IterationCap,
    })
}

struct CallOutcome {
    id: String,
    name: String,
    output: String,
    success: bool,
    duration_ms: u64,
}

/// Execute every call concurrently. `join_all` yields results in input
/// order, which is what keeps call ids and results paired positionally.
async fn execute_calls(
    tools: &ToolRegistry,
    calls: &[MessageToolCall],
    observer: Option<ToolCallObserver<'_>>,
) -> Vec<CallOutcome> {
    join_all(calls.iter().map(|call| async move {
        debug!(tool = %call.name, "Tool call");
        let arguments = call.parsed_arguments();
        if let Some(observer) = observer {
            observer(ToolCallUpdate::Started {
                name: &call.name,
                arguments: &arguments,
            });
        }
        let start = std::time::Instant::now();
        let output = execute_with_heartbeat(tools, &call.name, arguments, observer).await;
        CallOutcome {
            id: call.id.clone(),
            name: call.name.clone(),
            success: !output.starts_with("Error:"),
            duration_ms: start.elapsed().as_millis() as u64,
            output,
        }
    }))
    .await
}

/// Execute one call, firing a heartbeat every [`HEARTBEAT_SECS`] until it
/// returns.
async fn execute_with_heartbeat(
    tools: &ToolRegistry,
    name: &str,
    arguments: serde_json::Value,
    observer: Option<ToolCallObserver<'_>>,
) -> String {
    let exec = tools.execute(name, arguments);
    tokio::pin!(exec);
    let mut elapsed_secs = 0u64;
    loop {
        match tokio::time::timeout(Duration::from_secs(HEARTBEAT_SECS), &mut exec).await {
            Ok(output) => return output,
            Err(_) => {
                elapsed_secs += HEARTBEAT_SECS;
                if let Some(observer) = observer {
                    observer(ToolCallUpdate::Heartbeat { name, elapsed_secs });
                }
            }
        }
    }
}
