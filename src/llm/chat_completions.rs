//! OpenAI Chat Completions adapter.
//!
//! Streams `/v1/chat/completions`, assembles streamed tool calls, executes
//! them through the run's [`ToolBox`] and feeds the results back until the
//! model answers without tools, a turn-ending tool ran, or the step limit is
//! reached.

use std::collections::BTreeMap;

use anyhow::Context;
use futures::StreamExt;

use super::{
    AdapterKind, EventSink, LlmSettings, Message, ProviderAdapter, RawEvent, StreamConfig,
    ToolCall, ToolCallFunction,
};
use crate::tools::{ToolBox, ToolOutcome};

/// Accumulated state for a streaming tool call.
#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Parse state for one streamed request.
#[derive(Debug, Default)]
struct StepState {
    text: String,
    tools: BTreeMap<usize, ToolAccum>,
    reasoning: bool,
    done: bool,
}

impl StepState {
    /// Fold one `data:` payload into the state, returning events to emit.
    fn apply(&mut self, data: &str) -> anyhow::Result<Vec<RawEvent>> {
        let mut out = Vec::new();
        if data == "[DONE]" {
            self.done = true;
            return Ok(out);
        }

        let v: serde_json::Value = serde_json::from_str(data).context("malformed stream chunk")?;
        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map_or_else(|| err.to_string(), ToString::to_string);
            anyhow::bail!("provider error: {message}");
        }

        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            out.push(RawEvent::Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            });
        }

        let delta = &v["choices"][0]["delta"];

        if let Some(r) = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
        {
            if !self.reasoning {
                self.reasoning = true;
                out.push(RawEvent::ReasoningStart);
            }
            out.push(RawEvent::ReasoningDelta { text: r.to_string() });
        }

        if let Some(s) = delta
            .get("content")
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
        {
            if self.reasoning {
                self.reasoning = false;
                out.push(RawEvent::ReasoningEnd);
            }
            self.text.push_str(s);
            out.push(RawEvent::TextDelta { text: s.to_string() });
        }

        if let Some(arr) = delta.get("tool_calls").and_then(|x| x.as_array()) {
            for tc in arr {
                let idx = tc
                    .get("index")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|i| usize::try_from(i).ok())
                    .unwrap_or(0);
                let entry = self.tools.entry(idx).or_default();
                if entry.id.is_none() {
                    entry.id = tc.get("id").and_then(|x| x.as_str()).map(ToString::to_string);
                }
                let function = tc.get("function");
                if entry.name.is_none() {
                    entry.name = function
                        .and_then(|f| f.get("name"))
                        .and_then(|x| x.as_str())
                        .map(ToString::to_string);
                }
                if let Some(args) = function
                    .and_then(|f| f.get("arguments"))
                    .and_then(|x| x.as_str())
                {
                    entry.args.push_str(args);
                }
            }
        }

        Ok(out)
    }

    fn tool_calls(&self) -> Vec<ToolCall> {
        self.tools
            .values()
            .filter_map(|acc| {
                Some(ToolCall {
                    id: acc.id.clone()?,
                    call_type: "function".to_string(),
                    function: ToolCallFunction {
                        name: acc.name.clone()?,
                        arguments: acc.args.clone(),
                    },
                })
            })
            .collect()
    }
}

/// Adapter for OpenAI-compatible chat completion endpoints.
#[derive(Clone)]
pub struct ChatCompletionsAdapter {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsAdapter")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .field("provider", &self.settings.provider)
            .finish_non_exhaustive()
    }
}

/// How a streamed request ended.
enum StepEnd {
    Complete(StepState),
    Cancelled,
}

impl ChatCompletionsAdapter {
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    async fn stream_step(
        &self,
        sink: &EventSink,
        wire: &[serde_json::Value],
        config: &StreamConfig,
    ) -> anyhow::Result<StepEnd> {
        let model = if config.model.is_empty() {
            &self.settings.model
        } else {
            &config.model
        };
        let tools = config
            .tools
            .as_ref()
            .map(ToolBox::openai_tools_json)
            .unwrap_or_default();

        let mut body = serde_json::json!({
            "model": model,
            "stream": true,
            "messages": wire,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools);
            if let Some(parallel) = self.settings.parallel_tool_calls {
                body["parallel_tool_calls"] = serde_json::Value::Bool(parallel);
            }
        }
        if self.settings.provider.supports_stream_usage() {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        let url = self.settings.provider.build_chat_url(&self.settings.base_url);
        let rb = self
            .settings
            .provider
            .authorize(self.http.post(&url).json(&body), self.settings.api_key.as_deref());

        let resp = tokio::select! {
            () = config.cancel.cancelled() => return Ok(StepEnd::Cancelled),
            resp = rb.send() => resp.context("chat completions request failed")?,
        };
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat completions returned {status}: {detail}");
        }

        let byte_stream = resp.bytes_stream();
        futures::pin_mut!(byte_stream);
        let mut buf = Vec::<u8>::new();
        let mut state = StepState::default();

        while !state.done {
            let chunk = tokio::select! {
                () = config.cancel.cancelled() => return Ok(StepEnd::Cancelled),
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            buf.extend_from_slice(&chunk.context("stream interrupted")?);

            while let Some(pos) = find_double_newline(&buf) {
                let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                let text = String::from_utf8_lossy(&frame);
                for line in text.lines() {
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    for event in state.apply(data.trim())? {
                        if !sink.send(event).await {
                            return Ok(StepEnd::Cancelled);
                        }
                    }
                }
            }
        }

        if state.reasoning {
            state.reasoning = false;
            sink.send(RawEvent::ReasoningEnd).await;
        }
        Ok(StepEnd::Complete(state))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ChatCompletionsAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::ToolAugmented
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    #[tracing::instrument(skip_all, fields(model = %self.settings.model))]
    async fn stream_response(
        &self,
        sink: EventSink,
        messages: Vec<Message>,
        config: StreamConfig,
    ) -> anyhow::Result<Vec<Message>> {
        let mut wire: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = &config.system_prompt {
            wire.push(Message::system(prompt.clone()).to_wire());
        }
        wire.extend(messages.iter().map(Message::to_wire));

        let mut produced = Vec::new();

        for step in 1..=self.settings.max_steps.max(1) {
            tracing::debug!(step, message_count = wire.len(), "Starting chat step");

            let state = match self.stream_step(&sink, &wire, &config).await? {
                StepEnd::Complete(state) => state,
                StepEnd::Cancelled => {
                    tracing::debug!(step, "Chat step cancelled");
                    return Ok(produced);
                }
            };

            let tool_calls = state.tool_calls();
            if tool_calls.is_empty() {
                produced.push(Message::assistant(state.text));
                sink.send(RawEvent::FinishStep).await;
                sink.send(RawEvent::Finish).await;
                return Ok(produced);
            }

            let assistant = Message::assistant_with_tool_calls(state.text, tool_calls.clone());
            wire.push(assistant.to_wire());
            produced.push(assistant);

            let mut ends_turn = false;
            for call in &tool_calls {
                let input: serde_json::Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));
                let name = &call.function.name;

                // Every tool_call needs a response message, even when skipped.
                let outcome = if config.cancel.is_cancelled() || sink.is_closed() {
                    ToolOutcome {
                        content: "Tool call skipped: the run was stopped.".to_string(),
                        is_error: true,
                    }
                } else {
                    sink.send(RawEvent::ToolCall {
                        id: call.id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .await;
                    let outcome = match &config.tools {
                        Some(tools) => {
                            let outcome = tools.call(name, input, &sink, &config.cancel).await;
                            // A rejected plan or question call goes back to the model instead.
                            ends_turn |= tools.ends_turn(name) && !outcome.is_error;
                            outcome
                        }
                        None => ToolOutcome {
                            content: format!("Error: unknown tool: {name}"),
                            is_error: true,
                        },
                    };
                    sink.send(RawEvent::ToolResult {
                        id: call.id.clone(),
                        name: name.clone(),
                        output: outcome.content.clone(),
                        is_error: outcome.is_error,
                    })
                    .await;
                    outcome
                };

                let result = Message::tool_result(call.id.clone(), outcome.content);
                wire.push(result.to_wire());
                produced.push(result);
            }

            sink.send(RawEvent::FinishStep).await;

            if config.cancel.is_cancelled() {
                return Ok(produced);
            }
            if ends_turn {
                sink.send(RawEvent::Finish).await;
                return Ok(produced);
            }
        }

        tracing::warn!(max_steps = self.settings.max_steps, "Maximum tool steps exceeded");
        sink.send(RawEvent::Error {
            message: format!(
                "Stopped after {} tool steps without a final answer",
                self.settings.max_steps
            ),
        })
        .await;
        Ok(produced)
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_tool_call_assembly() {
        let mut state = StepState::default();
        let events = state
            .apply(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#)
            .unwrap();
        assert_eq!(events, vec![RawEvent::TextDelta { text: "Hi".into() }]);

        state
            .apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"read_file","arguments":"{\"pa"}}]}}]}"#)
            .unwrap();
        state
            .apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"a\"}"}}]}}]}"#)
            .unwrap();
        state.apply("[DONE]").unwrap();

        let calls = state.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].function.arguments, r#"{"path":"a"}"#);
        assert!(state.done);
        assert_eq!(state.text, "Hi");
    }

    #[test]
    fn test_reasoning_brackets() {
        let mut state = StepState::default();
        let first = state
            .apply(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#)
            .unwrap();
        assert_eq!(first[0], RawEvent::ReasoningStart);
        let second = state
            .apply(r#"{"choices":[{"delta":{"content":"ok"}}]}"#)
            .unwrap();
        assert_eq!(second[0], RawEvent::ReasoningEnd);
        assert!(!state.reasoning);
    }

    #[test]
    fn test_usage_and_provider_error() {
        let mut state = StepState::default();
        let events = state
            .apply(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#)
            .unwrap();
        assert_eq!(
            events,
            vec![RawEvent::Usage {
                input_tokens: 12,
                output_tokens: 3
            }]
        );
        assert!(state.apply(r#"{"error":{"message":"quota"}}"#).is_err());
    }

    #[test]
    fn test_find_double_newline() {
        assert_eq!(find_double_newline(b"data: x\n\nrest"), Some(7));
        assert_eq!(find_double_newline(b"data: x\n"), None);
    }
}
