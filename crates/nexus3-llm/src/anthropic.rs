//! Anthropic Messages API provider: SSE wire format normalized into
//! `nexus3_core::types::StreamEvent`.

use futures::StreamExt;
use nexus3_core::types::{Message, Role, StreamEvent};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::aggregator::ToolCallAggregator;
use crate::error::{LlmError, LlmResult};
use crate::provider::{LlmProvider, LlmRequest, LlmStream};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: Client::new(), api_key: api_key.into(), base_url: ANTHROPIC_API_URL.to_string() }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

fn render_content(message: &Message) -> serde_json::Value {
    if !message.tool_calls.is_empty() {
        let mut blocks = Vec::new();
        if !message.content.is_empty() {
            blocks.push(serde_json::json!({"type": "text", "text": message.content}));
        }
        for tc in &message.tool_calls {
            blocks.push(serde_json::json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.name,
                "input": serde_json::Value::Object(tc.arguments.clone()),
            }));
        }
        serde_json::Value::Array(blocks)
    } else if message.role == Role::Tool {
        serde_json::json!([{
            "type": "tool_result",
            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content,
        }])
    } else {
        serde_json::Value::String(message.content.clone())
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Assistant => "assistant",
        Role::System => "user", // system goes in the top-level `system` field, never inline
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete_stream(&self, request: LlmRequest) -> LlmResult<LlmStream> {
        let system = request.messages.iter().find(|m| m.role == Role::System).map(|m| m.content.clone());
        let conversation: Vec<&nexus3_core::types::Message> =
            request.messages.iter().filter(|m| m.role != Role::System).collect();

        let body = AnthropicRequest {
            model: request.model.clone(),
            messages: conversation
                .iter()
                .map(|m| AnthropicMessage { role: role_str(m.role).to_string(), content: render_content(m) })
                .collect(),
            max_tokens: request.max_tokens,
            stream: request.stream,
            system,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|t| AnthropicTool {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            input_schema: t.input_schema.clone(),
                        })
                        .collect(),
                )
            },
        };

        debug!(model = %body.model, "anthropic request");

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, body = %error_text, "anthropic error");
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited { retry_after_ms: 60_000 },
                _ => LlmError::RequestFailed(format!("{status}: {error_text}")),
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamEvent>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        let mut aggregator = ToolCallAggregator::new();
        let mut content = String::new();
        let mut current_tool_index: Option<usize> = None;
        let mut next_tool_index = 0usize;
        let mut completed = false;

        tokio::pin!(bytes_stream);

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buffer.find("\n\n") {
                let event_str = buffer[..event_end].to_string();
                buffer = buffer[event_end + 2..].to_string();

                let mut event_type = String::new();
                let mut event_data = String::new();
                for line in event_str.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event_type = rest.to_string();
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        event_data = rest.to_string();
                    }
                }
                if event_data.is_empty() {
                    continue;
                }

                match event_type.as_str() {
                    "content_block_start" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockStart>(&event_data) {
                            if let ContentBlockType::ToolUse { id, name } = data.content_block {
                                let index = next_tool_index;
                                next_tool_index += 1;
                                current_tool_index = Some(index);
                                aggregator.start(index, id.clone(), name.clone());
                                yield Ok(StreamEvent::ToolCallStarted { index, id, name });
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDelta>(&event_data) {
                            match data.delta {
                                DeltaType::TextDelta { text } => {
                                    content.push_str(&text);
                                    yield Ok(StreamEvent::ContentDelta(text));
                                }
                                DeltaType::ThinkingDelta { thinking } => {
                                    yield Ok(StreamEvent::ReasoningDelta(thinking));
                                }
                                DeltaType::InputJsonDelta { partial_json } => {
                                    if let Some(index) = current_tool_index {
                                        aggregator.push_arguments(index, &partial_json);
                                    }
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        current_tool_index = None;
                    }
                    "message_stop" => {
                        let tool_calls = std::mem::take(&mut aggregator).finish();
                        yield Ok(StreamEvent::StreamComplete(Message::assistant(content.clone(), tool_calls)));
                        completed = true;
                    }
                    "error" => {
                        if let Ok(data) = serde_json::from_str::<ErrorEvent>(&event_data) {
                            yield Err(LlmError::StreamError(data.error.message));
                            return;
                        }
                    }
                    _ => {}
                }
            }
        }

        // A stream that drops without an explicit message_stop (e.g. the
        // connection closed right after the last delta) still synthesizes
        // exactly one StreamComplete, per the provider contract.
        if !completed {
            let tool_calls = aggregator.finish();
            yield Ok(StreamEvent::StreamComplete(Message::assistant(content, tool_calls)));
        }
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlockType {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaType,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaType {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sse_body(events: &[(&str, &str)]) -> bytes::Bytes {
        let mut out = String::new();
        for (event, data) in events {
            out.push_str(&format!("event: {event}\ndata: {data}\n\n"));
        }
        bytes::Bytes::from(out)
    }

    #[tokio::test]
    async fn parses_text_then_completes() {
        let body = sse_body(&[
            ("content_block_start", r#"{"index":0,"content_block":{"type":"text","text":""}}"#),
            ("content_block_delta", r#"{"index":0,"delta":{"type":"text_delta","text":"hi"}}"#),
            ("message_stop", "{}"),
        ]);
        let stream = parse_sse_stream(futures::stream::once(async move { Ok(body) }));
        tokio::pin!(stream);

        let mut saw_complete = false;
        while let Some(event) = stream.next().await {
            if let StreamEvent::StreamComplete(m) = event.unwrap() {
                assert_eq!(m.content, "hi");
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn accumulates_tool_call_arguments_across_deltas() {
        let body = sse_body(&[
            (
                "content_block_start",
                r#"{"index":0,"content_block":{"type":"tool_use","id":"call-1","name":"echo"}}"#,
            ),
            ("content_block_delta", r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"message\""}}"#),
            ("content_block_delta", r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":":\"hi\"}"}}"#),
            ("content_block_stop", "{}"),
            ("message_stop", "{}"),
        ]);
        let stream = parse_sse_stream(futures::stream::once(async move { Ok(body) }));
        tokio::pin!(stream);

        let mut final_message = None;
        while let Some(event) = stream.next().await {
            if let StreamEvent::StreamComplete(m) = event.unwrap() {
                final_message = Some(m);
            }
        }
        let m = final_message.unwrap();
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.tool_calls[0].arguments.get("message").unwrap(), "hi");
    }

    #[tokio::test]
    async fn empty_stream_still_synthesizes_complete() {
        let stream = parse_sse_stream(futures::stream::empty());
        tokio::pin!(stream);
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, StreamEvent::StreamComplete(_)));
    }
}
