//! Self-contained agent CLI adapter.
//!
//! Spawns a configured command in the project directory. The request is
//! written to stdin as one JSON line; the process answers with
//! newline-delimited [`RawEvent`] JSON on stdout. The agent owns its tools,
//! so the orchestrator's tool box and system prompt are not forwarded.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{AdapterKind, EventSink, Message, ProviderAdapter, RawEvent, StreamConfig};

/// How to launch the agent process.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub model: String,
}

/// Adapter driving an external agent process.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    settings: CommandSettings,
}

impl CommandAdapter {
    #[must_use]
    pub fn new(settings: CommandSettings) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for CommandAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::SelfContained
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    #[tracing::instrument(skip_all, fields(command = %self.settings.command))]
    async fn stream_response(
        &self,
        sink: EventSink,
        messages: Vec<Message>,
        config: StreamConfig,
    ) -> anyhow::Result<Vec<Message>> {
        let model = if config.model.is_empty() {
            self.settings.model.clone()
        } else {
            config.model.clone()
        };

        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.args)
            .current_dir(&config.project_dir)
            .envs(&self.settings.env)
            .env("OVERLAY_MODEL", &model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("failed to spawn agent process")?;
        let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("missing stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("missing stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("missing stderr"))?;

        // Stderr is diagnostics only.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "overlay_agent::llm::command", line = %line, "agent stderr");
            }
        });

        let request = serde_json::json!({
            "model": model,
            "messages": messages,
            "project_dir": config.project_dir,
            "target_port": config.target_port,
            "creation_mode": config.creation_mode,
            "locale": config.locale,
        });
        let line = serde_json::to_string(&request)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let mut text = String::new();
        let mut terminal_seen = false;
        let mut cancelled = false;

        loop {
            let line = tokio::select! {
                () = config.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => line.context("reading agent output")?,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: RawEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, line = %line, "Ignoring non-event output");
                    continue;
                }
            };
            match &event {
                RawEvent::TextDelta { text: t } => text.push_str(t),
                RawEvent::Finish | RawEvent::Error { .. } => terminal_seen = true,
                _ => {}
            }
            if !sink.send(event).await {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Agent process already gone");
            }
        } else {
            let status = child.wait().await.context("waiting for agent process")?;
            if !terminal_seen {
                if status.success() {
                    sink.send(RawEvent::Finish).await;
                } else {
                    return Err(anyhow!("agent process exited with {status}"));
                }
            }
        }

        Ok(if text.is_empty() {
            Vec::new()
        } else {
            vec![Message::assistant(text)]
        })
    }
}
