//! End-to-end tests driving a running agent loop through the message bus.

use async_trait::async_trait;
use ferrobot_agent::AgentLoop;
use ferrobot_config::{AppConfig, TerminalConfig, TerminalProtocol};
use ferrobot_core::bus::{InboundMessage, MessageBus};
use ferrobot_core::error::ProviderError;
use ferrobot_core::message::{Message, MessageToolCall};
use ferrobot_core::provider::{Provider, ProviderRequest, ProviderResponse};
use ferrobot_core::session::{InMemorySessionStore, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Routes on conversation shape instead of replaying a fixed script, so
/// main-agent and subagent calls can interleave in any order.
struct RoutingProvider;

#[async_trait]
impl Provider for RoutingProvider {
    fn name(&self) -> &str {
        "routing"
    }

    async fn chat(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let message = if system.contains("subagent running one background task") {
            Message::assistant("Counted 3 files in the workspace.")
        } else if last == "boom" {
            return Err(ProviderError::Network("connection reset".into()));
        } else if last.contains("Subagent task completed") {
            Message::assistant("Your background task is done: 3 files.")
        } else if request.messages.iter().any(|m| !m.tool_calls.is_empty()) {
            Message::assistant("Delegated to a background task.")
        } else if last.contains("please count") {
            Message::assistant_with_calls(
                "",
                vec![MessageToolCall {
                    id: "c1".into(),
                    name: "spawn".into(),
                    arguments: "{\"task\": \"count files in the workspace\"}".into(),
                }],
            )
        } else {
            Message::assistant(format!("echo: {last}"))
        };

        Ok(ProviderResponse {
            message,
            usage: None,
            model: "routing-model".into(),
        })
    }
}

fn start_loop(
    config: AppConfig,
) -> (
    Arc<MessageBus>,
    Arc<InMemorySessionStore>,
    Arc<Notify>,
    JoinHandle<()>,
) {
    let bus = Arc::new(MessageBus::new());
    let store = Arc::new(InMemorySessionStore::new());
    let mut agent = AgentLoop::new(
        bus.clone(),
        Arc::new(RoutingProvider),
        store.clone(),
        &config,
        "/tmp",
    );
    let shutdown = agent.shutdown_handle();
    let handle = tokio::spawn(async move { agent.run().await });
    (bus, store, shutdown, handle)
}

async fn next_outbound(bus: &MessageBus) -> ferrobot_core::bus::OutboundMessage {
    timeout(Duration::from_secs(10), bus.consume_outbound())
        .await
        .expect("timed out waiting for a response")
        .expect("bus closed")
}

#[tokio::test]
async fn bus_round_trip() {
    let (bus, store, shutdown, handle) = start_loop(AppConfig::default());

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "hello there"));
    let out = next_outbound(&bus).await;
    assert_eq!(out.content, "echo: hello there");
    assert_eq!(out.channel, "cli");
    assert_eq!(out.chat_id, "1");

    let session = store.get_or_create("cli:1").await;
    assert_eq!(session.messages.len(), 2);

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn commands_answer_without_the_provider() {
    let (bus, _store, shutdown, handle) = start_loop(AppConfig::default());

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "/help"));
    let help = next_outbound(&bus).await;
    assert!(help.content.contains("Available commands"));

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "/model"));
    let status = next_outbound(&bus).await;
    assert!(status.content.contains("Current model:"));

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn provider_failure_does_not_stop_the_loop() {
    let (bus, _store, shutdown, handle) = start_loop(AppConfig::default());

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "boom"));
    let first = next_outbound(&bus).await;
    assert!(first.content.starts_with("Sorry, I encountered an error"));
    assert!(first.content.contains("connection reset"));

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "still here"));
    let second = next_outbound(&bus).await;
    assert_eq!(second.content, "echo: still here");

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn subagent_result_is_announced_to_the_origin() {
    let (bus, store, shutdown, handle) = start_loop(AppConfig::default());

    bus.publish_inbound(InboundMessage::new(
        "cli",
        "user",
        "1",
        "please count the files",
    ));

    // The default moderate debug level surfaces the spawn call as a
    // transient progress update before the main turn's answer.
    let progress = next_outbound(&bus).await;
    assert!(progress.transient);
    assert_eq!(progress.content, "⏳ `spawn`: count files in the workspace");

    // The main turn finishes first: the spawn tool returns immediately.
    let spawned = next_outbound(&bus).await;
    assert_eq!(spawned.content, "Delegated to a background task.");

    // The subagent announces through the system channel and the loop
    // relays the result to the originating conversation.
    let announced = next_outbound(&bus).await;
    assert_eq!(announced.channel, "cli");
    assert_eq!(announced.chat_id, "1");
    assert_eq!(announced.content, "Your background task is done: 3 files.");

    // The announce is stored in the origin session with a system marker.
    let session = store.get_or_create("cli:1").await;
    assert!(session
        .messages
        .iter()
        .any(|m| m.content.starts_with("[System: subagent:")));

    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn terminal_mode_round_trip_persists_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.terminal = Some(TerminalConfig {
        command: "echo ran: {message}".into(),
        protocol: TerminalProtocol::Plain,
        timeout_secs: 10,
        pass_media: true,
        env: HashMap::new(),
        providers: HashMap::new(),
    });

    let bus = Arc::new(MessageBus::new());
    let store = Arc::new(InMemorySessionStore::new());
    let mut agent = AgentLoop::new(
        bus.clone(),
        Arc::new(RoutingProvider),
        store.clone(),
        &config,
        dir.path().to_str().unwrap(),
    );
    let shutdown = agent.shutdown_handle();
    let handle = tokio::spawn(async move { agent.run().await });

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "list files"));
    let out = next_outbound(&bus).await;
    assert!(out.content.contains("ran: list files"));

    // Terminal turns are stored like engine turns.
    let session = store.get_or_create("cli:1").await;
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].content, "list files");
    assert!(session.messages[1].content.contains("ran: list files"));

    shutdown.notify_one();
    handle.await.unwrap();
}
