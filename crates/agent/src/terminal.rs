//! Terminal mode: the whole turn is delegated to an external subprocess.
//!
//! Two wire protocols:
//!
//! - **plain** (default): run to completion under a timeout, capture
//!   stdout/stderr, scan stdout for media file paths.
//! - **rich**: stream stdout line-by-line as JSONL frames (`message`,
//!   `progress`, `error`, `log`). Progress frames go out immediately as
//!   transient messages; the last `message` frame becomes the final
//!   response.
//!
//! Both protocols receive exactly one JSON envelope on stdin (then stdin is
//! closed) with the user text, media paths, session identity, workspace,
//! and optional provider credentials.

use ferrobot_config::{ProviderConfig, TerminalConfig, TerminalProtocol};
use ferrobot_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use regex_lite::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// File extensions recognized as media in subprocess output.
const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "mp4", "mov", "avi", "mkv", "webm", "mp3", "ogg",
    "m4a", "wav", "flac", "pdf",
];

/// Provider names with a conventional API-key environment variable.
const PROVIDER_ENV_VARS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("google", "GOOGLE_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("mistral", "MISTRAL_API_KEY"),
    ("cohere", "COHERE_API_KEY"),
];

/// Absolute file paths in subprocess output.
const PATH_PATTERN: &str = r"(?m)(?:^|\s)(/[\w./-]+)";

/// Scan text for absolute paths with a known media extension that exist
/// on disk.
pub fn extract_media_paths(text: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(PATH_PATTERN) else {
        return Vec::new();
    };

    let mut media = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for captures in pattern.captures_iter(text) {
        let Some(raw) = captures.get(1) else {
            continue;
        };
        let resolved = std::fs::canonicalize(raw.as_str())
            .unwrap_or_else(|_| PathBuf::from(raw.as_str()));
        let Some(ext) = resolved.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            continue;
        }
        let display = resolved.to_string_lossy().to_string();
        if resolved.is_file() && seen.insert(display.clone()) {
            media.push(display);
        }
    }
    media
}

/// POSIX single-quote escaping for the `{message}` substitution.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn build_command(template: &str, msg: &InboundMessage) -> String {
    template.replace("{message}", &shell_quote(msg.content.trim()))
}

/// Per-user data directory: `{workspace}/users/{chat_id}`, created on
/// demand.
fn ensure_user_data_dir(workspace: &str, chat_id: &str) -> std::io::Result<String> {
    let dir = Path::new(workspace).join("users").join(chat_id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir.to_string_lossy().to_string())
}

/// The JSON envelope written to the subprocess's stdin.
fn build_input_envelope(
    msg: &InboundMessage,
    workspace: &str,
    config: &TerminalConfig,
) -> std::io::Result<String> {
    let user_data_dir = ensure_user_data_dir(workspace, &msg.chat_id)?;
    let mut envelope = serde_json::json!({
        "version": 1,
        "text": msg.content,
        "channel": msg.channel,
        "chat_id": msg.chat_id,
        "session_key": msg.session_key(),
        "workspace": workspace,
        "user_data_dir": user_data_dir,
    });
    if config.pass_media && !msg.media.is_empty() {
        envelope["media"] = serde_json::json!(msg.media);
    }
    let with_keys: serde_json::Map<String, serde_json::Value> = config
        .providers
        .iter()
        .filter(|(_, p)| !p.api_keys.is_empty())
        .map(|(name, p)| {
            let mut entry = serde_json::json!({ "api_keys": p.api_keys });
            if !p.models.is_empty() {
                entry["models"] = serde_json::json!(p.models);
            }
            if let Some(base_url) = &p.base_url {
                entry["base_url"] = serde_json::json!(base_url);
            }
            (name.clone(), entry)
        })
        .collect();
    if !with_keys.is_empty() {
        envelope["providers"] = serde_json::Value::Object(with_keys);
    }
    Ok(envelope.to_string())
}

/// Extra environment variables for the subprocess: provider keys under
/// their conventional names plus `{NAME}_API_KEYS` (comma-joined), then
/// static vars from config (which win).
fn build_env(
    env: &HashMap<String, String>,
    providers: &HashMap<String, ProviderConfig>,
) -> Vec<(String, String)> {
    let mut extras = Vec::new();
    for (name, provider) in providers {
        if provider.api_keys.is_empty() {
            continue;
        }
        if let Some((_, var)) = PROVIDER_ENV_VARS.iter().find(|(n, _)| n == name) {
            extras.push((var.to_string(), provider.api_keys[0].clone()));
        }
        extras.push((
            format!("{}_API_KEYS", name.to_uppercase()),
            provider.api_keys.join(","),
        ));
    }
    for (key, value) in env {
        extras.push((key.clone(), value.clone()));
    }
    extras
}

/// A JSONL frame on the rich protocol's stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Message {
        #[serde(default)]
        text: String,
        #[serde(default)]
        media: Vec<String>,
    },
    Progress {
        #[serde(default)]
        text: String,
    },
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        text: String,
    },
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        text: String,
    },
}

/// Execute a terminal turn using the configured protocol. Intermediate
/// messages (rich progress and superseded message frames) are published
/// straight onto `bus`; the returned message, if any, is the final
/// response. Every failure mode comes back as message content; terminal
/// mode never takes down the loop.
pub async fn run_terminal_command(
    msg: &InboundMessage,
    config: &TerminalConfig,
    workspace: &str,
    bus: &MessageBus,
) -> Option<OutboundMessage> {
    match config.protocol {
        TerminalProtocol::Plain => Some(run_plain(msg, config, workspace).await),
        TerminalProtocol::Rich => run_rich(msg, config, workspace, bus).await,
    }
}

fn spawn_process(
    command: &str,
    workspace: &str,
    config: &TerminalConfig,
) -> std::io::Result<tokio::process::Child> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .envs(build_env(&config.env, &config.providers))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

async fn write_envelope(child: &mut tokio::process::Child, envelope: &str) {
    if let Some(mut stdin) = child.stdin.take() {
        let payload = format!("{envelope}\n");
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            warn!(error = %e, "Failed to write terminal stdin");
        }
        // Dropping stdin closes it; the subprocess sees EOF after the
        // envelope.
    }
}

async fn run_plain(msg: &InboundMessage, config: &TerminalConfig, workspace: &str) -> OutboundMessage {
    let command = build_command(&config.command, msg);
    info!(session_key = %msg.session_key(), "Terminal exec");

    let envelope = match build_input_envelope(msg, workspace, config) {
        Ok(envelope) => envelope,
        Err(e) => {
            return OutboundMessage::new(&msg.channel, &msg.chat_id, format!("Error: {e}"));
        }
    };

    let mut child = match spawn_process(&command, workspace, config) {
        Ok(child) => child,
        Err(e) => {
            return OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                format!("Error starting process: {e}"),
            );
        }
    };
    write_envelope(&mut child, &envelope).await;

    let output = match tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return OutboundMessage::new(&msg.channel, &msg.chat_id, format!("Error: {e}"));
        }
        Err(_) => {
            // kill_on_drop reaps the abandoned child.
            warn!(
                session_key = %msg.session_key(),
                timeout_secs = config.timeout_secs,
                "Terminal process killed on timeout"
            );
            return OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                format!("Command timed out after {}s", config.timeout_secs),
            );
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut parts: Vec<String> = Vec::new();
    if !stdout.trim().is_empty() {
        parts.push(stdout.trim().to_string());
    }
    if !stderr.trim().is_empty() {
        parts.push(format!("STDERR:\n{}", stderr.trim()));
    }
    if let Some(code) = output.status.code()
        && code != 0
    {
        parts.push(format!("Exit code: {code}"));
    }
    let content = if parts.is_empty() {
        "(no output)".to_string()
    } else {
        parts.join("\n")
    };

    let media = extract_media_paths(&stdout);
    OutboundMessage::new(&msg.channel, &msg.chat_id, content).with_media(media)
}

async fn run_rich(
    msg: &InboundMessage,
    config: &TerminalConfig,
    workspace: &str,
    bus: &MessageBus,
) -> Option<OutboundMessage> {
    let command = build_command(&config.command, msg);
    info!(session_key = %msg.session_key(), "Terminal rich exec");

    let envelope = match build_input_envelope(msg, workspace, config) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Some(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                format!("Error: {e}"),
            ));
        }
    };

    let mut child = match spawn_process(&command, workspace, config) {
        Ok(child) => child,
        Err(e) => {
            return Some(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                format!("Error starting process: {e}"),
            ));
        }
    };
    write_envelope(&mut child, &envelope).await;

    let Some(stdout) = child.stdout.take() else {
        return Some(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            "Error: terminal stdout unavailable".to_string(),
        ));
    };
    let mut lines = BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.timeout_secs);
    let mut accumulated: Vec<String> = Vec::new();
    let mut final_message: Option<OutboundMessage> = None;
    let mut timed_out = false;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break;
        }
        let line = match tokio::time::timeout(remaining, lines.next_line()).await {
            Err(_) => {
                timed_out = true;
                break;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Error reading terminal stdout");
                break;
            }
            Ok(Ok(None)) => break, // EOF
            Ok(Ok(Some(line))) => line,
        };
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        let value: Option<serde_json::Value> = serde_json::from_str(line).ok();
        let Some(value) = value.filter(|v| v.is_object() && v.get("type").is_some()) else {
            // Non-frame line: accumulate as plain text.
            accumulated.push(line.to_string());
            continue;
        };

        match serde_json::from_value::<Frame>(value.clone()) {
            Ok(Frame::Progress { text }) => {
                bus.publish_outbound(
                    OutboundMessage::new(&msg.channel, &msg.chat_id, format!("⏳ {text}"))
                        .transient(),
                );
            }
            Ok(Frame::Message { text, media }) => {
                // Intermediate messages go out now; the latest one is held
                // as the candidate final response.
                if let Some(previous) = final_message.take() {
                    bus.publish_outbound(previous);
                }
                final_message = Some(
                    OutboundMessage::new(&msg.channel, &msg.chat_id, text).with_media(media),
                );
            }
            Ok(Frame::Error { code, text }) => {
                let prefix = if code.is_empty() {
                    "Error: ".to_string()
                } else {
                    format!("Error ({code}): ")
                };
                final_message = Some(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    format!("{prefix}{text}"),
                ));
            }
            Ok(Frame::Log { level, text }) => match level.as_str() {
                "error" => error!(terminal = true, "{text}"),
                "warning" | "warn" => warn!(terminal = true, "{text}"),
                "info" => info!(terminal = true, "{text}"),
                _ => debug!(terminal = true, "{text}"),
            },
            Err(_) => {
                debug!(frame = %value["type"], "Unknown terminal frame type");
            }
        }
    }

    if timed_out {
        let _ = child.kill().await;
        warn!(
            session_key = %msg.session_key(),
            timeout_secs = config.timeout_secs,
            "Terminal process killed after timeout"
        );
        // Already-forwarded frames stand; the held final goes out before
        // the timeout notice.
        if let Some(held) = final_message.take() {
            bus.publish_outbound(held);
        }
        return Some(OutboundMessage::new(
            &msg.channel,
            &msg.chat_id,
            format!("Command timed out after {}s", config.timeout_secs),
        ));
    }

    // Drain stderr (never parsed) and collect the exit code.
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    let stderr = stderr.trim().to_string();
    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "Failed to wait for terminal process");
            -1
        }
    };
    if exit_code != 0 {
        warn!(session_key = %msg.session_key(), exit_code, "Terminal process exited nonzero");
    }

    let mut extras: Vec<String> = Vec::new();
    if !stderr.is_empty() {
        extras.push(format!("STDERR:\n{stderr}"));
    }
    if exit_code != 0 {
        extras.push(format!("Exit code: {exit_code}"));
    }

    match final_message {
        Some(mut message) => {
            if !extras.is_empty() {
                message.content = format!("{}\n{}", message.content, extras.join("\n"));
            }
            Some(message)
        }
        None if !accumulated.is_empty() => {
            // Plain-text fallback: the process never spoke the protocol.
            let combined = accumulated.join("\n");
            let media = extract_media_paths(&combined);
            let mut parts = vec![combined];
            parts.extend(extras);
            Some(
                OutboundMessage::new(&msg.channel, &msg.chat_id, parts.join("\n"))
                    .with_media(media),
            )
        }
        None => {
            let content = if extras.is_empty() {
                "(no output)".to_string()
            } else {
                extras.join("\n")
            };
            Some(OutboundMessage::new(&msg.channel, &msg.chat_id, content))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage::new("cli", "user", "direct", content)
    }

    fn terminal_config(command: &str, protocol: TerminalProtocol, timeout_secs: u64) -> TerminalConfig {
        TerminalConfig {
            command: command.into(),
            protocol,
            timeout_secs,
            pass_media: true,
            env: HashMap::new(),
            providers: HashMap::new(),
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn envelope_carries_session_identity() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let config = terminal_config("cat", TerminalProtocol::Plain, 10);

        let envelope = build_input_envelope(&inbound("hello"), workspace, &config).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        assert_eq!(parsed["version"], 1);
        assert_eq!(parsed["text"], "hello");
        assert_eq!(parsed["session_key"], "cli:direct");
        // user_data_dir was created on demand.
        assert!(dir.path().join("users/direct").is_dir());
    }

    #[test]
    fn env_injects_provider_keys() {
        let providers = HashMap::from([(
            "anthropic".to_string(),
            ProviderConfig {
                api_keys: vec!["sk-1".into(), "sk-2".into()],
                models: vec![],
                base_url: None,
            },
        )]);
        let extras = build_env(&HashMap::new(), &providers);
        assert!(extras.contains(&("ANTHROPIC_API_KEY".into(), "sk-1".into())));
        assert!(extras.contains(&("ANTHROPIC_API_KEYS".into(), "sk-1,sk-2".into())));
    }

    #[test]
    fn media_scan_finds_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("out.png");
        std::fs::File::create(&image)
            .unwrap()
            .write_all(b"png")
            .unwrap();

        let text = format!(
            "Saved to {} and also /does/not/exist.png plus notes.txt",
            image.display()
        );
        let media = extract_media_paths(&text);
        assert_eq!(media.len(), 1);
        assert!(media[0].ends_with("out.png"));
    }

    #[test]
    fn media_scan_matches_at_line_starts_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("chart.png");
        std::fs::File::create(&image)
            .unwrap()
            .write_all(b"png")
            .unwrap();

        // Paths are only recognized at a line start or after whitespace,
        // and repeated mentions collapse to one entry.
        let text = format!("{p}\nsee {p} again\nglued({p})", p = image.display());
        let media = extract_media_paths(&text);
        assert_eq!(media.len(), 1);
        assert!(media[0].ends_with("chart.png"));
    }

    #[tokio::test]
    async fn plain_mode_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let config = terminal_config(
            "echo out; echo err 1>&2; exit 3",
            TerminalProtocol::Plain,
            10,
        );

        let bus = MessageBus::new();
        let out = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert!(out.content.contains("out"));
        assert!(out.content.contains("STDERR:\nerr"));
        assert!(out.content.contains("Exit code: 3"));
    }

    #[tokio::test]
    async fn plain_mode_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let config = terminal_config("sleep 10", TerminalProtocol::Plain, 1);

        let bus = MessageBus::new();
        let out = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert!(out.content.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn rich_mode_streams_progress_then_message() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let command = r#"printf '%s\n%s\n' '{"type":"progress","text":"working"}' '{"type":"message","text":"all done"}'"#;
        let config = terminal_config(command, TerminalProtocol::Rich, 10);

        let bus = MessageBus::new();
        let final_message = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert_eq!(final_message.content, "all done");
        assert!(!final_message.transient);

        let progress = bus.try_consume_outbound().await.unwrap();
        assert_eq!(progress.content, "⏳ working");
        assert!(progress.transient);
    }

    #[tokio::test]
    async fn rich_mode_error_frame_becomes_final() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let command = r#"echo '{"type":"error","code":"E42","text":"broke"}'"#;
        let config = terminal_config(command, TerminalProtocol::Rich, 10);

        let bus = MessageBus::new();
        let out = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert_eq!(out.content, "Error (E42): broke");
    }

    #[tokio::test]
    async fn rich_mode_timeout_delivers_held_message_first() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let command = r#"echo '{"type":"message","text":"partial"}'; sleep 10"#;
        let config = terminal_config(command, TerminalProtocol::Rich, 1);

        let bus = MessageBus::new();
        let out = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert!(out.content.contains("timed out after 1s"));

        let held = bus.try_consume_outbound().await.unwrap();
        assert_eq!(held.content, "partial");
    }

    #[tokio::test]
    async fn rich_mode_plain_text_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let config = terminal_config("echo not json at all", TerminalProtocol::Rich, 10);

        let bus = MessageBus::new();
        let out = run_terminal_command(&inbound("x"), &config, workspace, &bus)
            .await
            .unwrap();
        assert_eq!(out.content, "not json at all");
    }

    #[tokio::test]
    async fn message_placeholder_is_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_str().unwrap();
        let config = terminal_config("echo {message}", TerminalProtocol::Plain, 10);

        let bus = MessageBus::new();
        let out = run_terminal_command(
            &inbound("hello; rm -rf /"),
            &config,
            workspace,
            &bus,
        )
        .await
        .unwrap();
        assert!(out.content.contains("hello; rm -rf /"));
    }
}
