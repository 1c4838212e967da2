//! Background subagents: delegated tasks with a reduced toolset.
//!
//! A subagent is an independent engine run spawned off the main loop. It
//! gets a freshly constructed registry with execution and file tools only,
//! never message or spawn capability, so a subagent cannot contact the user
//! directly or recurse. When it finishes (success or failure) it announces
//! its result as a synthetic inbound message on the `system` channel, which
//! re-enters the ordinary agent loop and gets full hook treatment before
//! anything reaches the user.

use crate::engine::{run_tool_loop, EngineParams};
use ferrobot_config::ExecConfig;
use ferrobot_core::bus::{InboundMessage, MessageBus};
use ferrobot_core::error::{AgentError, ToolError};
use ferrobot_core::event::{DomainEvent, EventBus};
use ferrobot_core::message::Message;
use ferrobot_core::provider::Provider;
use ferrobot_core::tool::{Tool, ToolRegistry};
use ferrobot_tools::{ExecTool, FileReadTool, FileWriteTool};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SUBAGENT_PROMPT: &str =
    "You are a subagent running one background task for a main agent. \
     Complete the task using your tools, then reply with a concise summary \
     of what you did and found. You cannot talk to the user directly; your \
     final reply is delivered back to the main agent.";

/// Minimum iteration budget a subagent gets even when the main budget is
/// tiny.
const MIN_SUBAGENT_ITERATIONS: u32 = 4;

/// Spawns and tracks background subagent tasks.
pub struct SubagentManager {
    /// Current provider and model, hot-swappable via `/model`.
    active: Mutex<(Arc<dyn Provider>, String)>,
    bus: Arc<MessageBus>,
    events: Arc<EventBus>,
    workspace: String,
    exec_config: ExecConfig,
    semaphore: Arc<Semaphore>,
    limit: usize,
    max_iterations: u32,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        bus: Arc<MessageBus>,
        events: Arc<EventBus>,
        workspace: impl Into<String>,
        exec_config: ExecConfig,
        max_concurrent: usize,
        main_max_iterations: u32,
    ) -> Self {
        Self {
            active: Mutex::new((provider, model.into())),
            bus,
            events,
            workspace: workspace.into(),
            exec_config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            limit: max_concurrent,
            max_iterations: (main_max_iterations / 2).max(MIN_SUBAGENT_ITERATIONS),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Swap the provider and model used by future subagent runs.
    pub fn set_provider(&self, provider: Arc<dyn Provider>, model: impl Into<String>) {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = (provider, model.into());
    }

    /// The reduced registry subagents run with: execution and file tools
    /// scoped to the workspace, built from scratch. Message and spawn
    /// capability are absent by construction, not by filtering.
    fn build_registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ExecTool::new(&self.exec_config)),
            Arc::new(FileReadTool::scoped_to(&self.workspace)),
            Arc::new(FileWriteTool::scoped_to(&self.workspace)),
        ];
        for tool in tools {
            // Fresh registry, fixed set: collisions are impossible.
            let _ = registry.register(tool);
        }
        registry
    }

    /// Start a background task. Fails fast with `CapacityExceeded` when
    /// the concurrency cap is reached; tasks are never queued.
    pub fn spawn(
        self: &Arc<Self>,
        task: impl Into<String>,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> Result<String, AgentError> {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!(limit = self.limit, "Subagent capacity exceeded");
            return Err(AgentError::CapacityExceeded { limit: self.limit });
        };

        let task = task.into();
        let task_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let origin = format!("{origin_channel}:{origin_chat_id}");
        info!(task_id = %task_id, origin = %origin, "Spawning subagent");

        let manager = Arc::clone(self);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            manager.run_task(&id, &task, &origin).await;
        });

        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        Ok(task_id)
    }

    async fn run_task(&self, task_id: &str, task: &str, origin: &str) {
        let (provider, model) = {
            let active = match self.active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.clone()
        };

        let registry = self.build_registry();
        let mut messages = vec![Message::system(SUBAGENT_PROMPT), Message::user(task)];

        let session_key = format!("subagent:{task_id}");
        let outcome = run_tool_loop(
            EngineParams {
                provider: provider.as_ref(),
                tools: &registry,
                model: &model,
                temperature: 0.7,
                max_tokens: None,
                max_iterations: self.max_iterations,
                session_key: &session_key,
                events: &self.events,
                on_tool_call: None,
            },
            &mut messages,
        )
        .await;

        let (success, report) = match outcome {
            Ok(result) if !result.text.is_empty() => (true, result.text),
            Ok(_) => (true, "Task finished with no output.".to_string()),
            Err(e) => {
                error!(task_id, error = %e, "Subagent run failed");
                (false, format!("Task failed: {e}"))
            }
        };

        self.events.publish(DomainEvent::SubagentFinished {
            task_id: task_id.to_string(),
            success,
            timestamp: chrono::Utc::now(),
        });

        let status = if success { "completed" } else { "failed" };
        let content = format!("Subagent task {status}.\n\nTask: {task}\n\nResult:\n{report}");

        // The announce re-enters the main loop; the origin is carried in
        // chat_id so the final response routes back to the right chat.
        self.bus.publish_inbound(InboundMessage::new(
            "system",
            format!("subagent:{task_id}"),
            origin,
            content,
        ));
        info!(task_id, status, "Subagent announced result");
    }

    /// Abort any still-running subagent tasks.
    pub fn shutdown(&self) {
        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn registry_names(&self) -> Vec<String> {
        self.build_registry()
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// The `spawn` tool the main agent uses to delegate work. Context-aware:
/// the origin conversation is bound per turn so announces route home.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    context: Mutex<(String, String)>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            context: Mutex::new((String::new(), String::new())),
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Delegate a task to a background subagent. The subagent works \
         independently with shell and file tools and reports back when done. \
         Use for long-running or parallelizable work."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "A complete, self-contained description of the task"
                }
            },
            "required": ["task"]
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
        let task = arguments["task"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'task' argument".into()))?;

        let (channel, chat_id) = {
            let guard = match self.context.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };

        match self.manager.spawn(task, &channel, &chat_id) {
            Ok(task_id) => Ok(format!(
                "Subagent {task_id} started. It will announce its result when done."
            )),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: "spawn".into(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobot_core::error::ProviderError;
    use ferrobot_core::provider::{ProviderRequest, ProviderResponse};
    use tokio::sync::Notify;

    /// A provider that blocks until released, then answers with fixed text.
    struct GatedProvider {
        gate: Arc<Notify>,
        response: String,
    }

    #[async_trait]
    impl Provider for GatedProvider {
        fn name(&self) -> &str {
            "gated"
        }

        async fn chat(
            &self,
            _request: ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.gate.notified().await;
            Ok(ProviderResponse {
                message: Message::assistant(&self.response),
                usage: None,
                model: "mock-model".into(),
            })
        }
    }

    fn manager_with(
        provider: Arc<dyn Provider>,
        bus: Arc<MessageBus>,
        max_concurrent: usize,
    ) -> Arc<SubagentManager> {
        Arc::new(SubagentManager::new(
            provider,
            "mock-model",
            bus,
            Arc::new(EventBus::default()),
            "/tmp",
            ExecConfig::default(),
            max_concurrent,
            20,
        ))
    }

    #[tokio::test]
    async fn reduced_registry_has_no_send_or_spawn_capability() {
        let bus = Arc::new(MessageBus::new());
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            Arc::new(GatedProvider {
                gate,
                response: "done".into(),
            }),
            bus,
            1,
        );
        assert_eq!(manager.registry_names(), vec!["exec", "file_read", "file_write"]);
    }

    #[tokio::test]
    async fn file_tools_are_scoped_to_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let manager = SubagentManager::new(
            Arc::new(GatedProvider {
                gate,
                response: "done".into(),
            }),
            "mock-model",
            Arc::new(MessageBus::new()),
            Arc::new(EventBus::default()),
            dir.path().to_str().unwrap(),
            ExecConfig::default(),
            1,
            20,
        );

        let registry = manager.build_registry();
        let outside = registry
            .execute(
                "file_read",
                serde_json::json!({"path": "/etc/hostname"}),
            )
            .await;
        assert!(outside.starts_with("Error:"));

        let inside_path = dir.path().join("note.txt");
        std::fs::write(&inside_path, "scoped").unwrap();
        let inside = registry
            .execute(
                "file_read",
                serde_json::json!({"path": inside_path.to_str().unwrap()}),
            )
            .await;
        assert_eq!(inside, "scoped");
    }

    #[tokio::test]
    async fn capacity_is_enforced_fail_fast() {
        let bus = Arc::new(MessageBus::new());
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            Arc::new(GatedProvider {
                gate: gate.clone(),
                response: "done".into(),
            }),
            bus,
            1,
        );

        manager.spawn("first task", "cli", "1").unwrap();
        let err = manager.spawn("second task", "cli", "1").unwrap_err();
        assert!(matches!(err, AgentError::CapacityExceeded { limit: 1 }));

        gate.notify_waiters();
        manager.shutdown();
    }

    #[tokio::test]
    async fn announce_routes_origin_through_chat_id() {
        let bus = Arc::new(MessageBus::new());
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            Arc::new(GatedProvider {
                gate: gate.clone(),
                response: "found 3 files".into(),
            }),
            bus.clone(),
            1,
        );

        let task_id = manager.spawn("count files", "telegram", "42").unwrap();

        // Release the provider and wait for the announce.
        gate.notify_one();
        let announce = bus.consume_inbound().await.unwrap();
        assert_eq!(announce.channel, "system");
        assert_eq!(announce.sender_id, format!("subagent:{task_id}"));
        assert_eq!(announce.chat_id, "telegram:42");
        assert!(announce.content.contains("completed"));
        assert!(announce.content.contains("found 3 files"));
    }

    #[tokio::test]
    async fn provider_failure_still_announces() {
        struct FailingProvider;

        #[async_trait]
        impl Provider for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            async fn chat(
                &self,
                _request: ProviderRequest,
            ) -> Result<ProviderResponse, ProviderError> {
                Err(ProviderError::Network("unreachable".into()))
            }
        }

        let bus = Arc::new(MessageBus::new());
        let manager = manager_with(Arc::new(FailingProvider), bus.clone(), 1);
        manager.spawn("doomed task", "cli", "1").unwrap();

        let announce = bus.consume_inbound().await.unwrap();
        assert_eq!(announce.channel, "system");
        assert!(announce.content.contains("failed"));
        assert!(announce.content.contains("unreachable"));
    }

    #[tokio::test]
    async fn spawn_tool_reports_capacity_as_error() {
        let bus = Arc::new(MessageBus::new());
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            Arc::new(GatedProvider {
                gate: gate.clone(),
                response: "done".into(),
            }),
            bus,
            1,
        );

        let tool = SpawnTool::new(manager.clone());
        tool.set_context("cli", "1");

        let first = tool
            .execute(serde_json::json!({"task": "one"}))
            .await
            .unwrap();
        assert!(first.contains("started"));

        let err = tool
            .execute(serde_json::json!({"task": "two"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("capacity"));

        gate.notify_waiters();
        manager.shutdown();
    }
}
