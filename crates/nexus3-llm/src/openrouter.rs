//! OpenRouter provider: OpenAI-style chunked `delta` streaming normalized
//! into `nexus3_core::types::StreamEvent`. Grounded on the same SSE-framing
//! approach as the Anthropic provider but with a different per-chunk shape
//! (one JSON object per `data:` line, no `event:` line, terminated by the
//! literal `data: [DONE]`) — the second concrete wire format needed to
//! prove the abstraction covers both streaming styles.

use futures::StreamExt;
use nexus3_core::types::{Message, Role, StreamEvent};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::aggregator::ToolCallAggregator;
use crate::error::{LlmError, LlmResult};
use crate::provider::{LlmProvider, LlmRequest, LlmStream};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { client: Client::new(), api_key: api_key.into(), base_url: OPENROUTER_API_URL.to_string() }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    ChatMessage {
        role: role_str(message.role).to_string(),
        content: if message.content.is_empty() && !message.tool_calls.is_empty() {
            None
        } else {
            Some(message.content.clone())
        },
        tool_call_id: message.tool_call_id.clone(),
        tool_calls: if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|tc| ChatToolCall {
                        id: tc.id.clone(),
                        function: ChatFunctionCall {
                            name: tc.name.clone(),
                            arguments: serde_json::Value::Object(tc.arguments.clone()).to_string(),
                        },
                    })
                    .collect(),
            )
        },
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete_stream(&self, request: LlmRequest) -> LlmResult<LlmStream> {
        let body = ChatRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(to_chat_message).collect(),
            stream: request.stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(
                    request
                        .tools
                        .iter()
                        .map(|t| ChatTool {
                            r#type: "function".to_string(),
                            function: ChatFunctionDef {
                                name: t.name.clone(),
                                description: t.description.clone(),
                                parameters: t.input_schema.clone(),
                            },
                        })
                        .collect(),
                )
            },
        };

        debug!(model = %body.model, "openrouter request");

        let response = self
            .client
            .post(&self.base_url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, body = %error_text, "openrouter error");
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited { retry_after_ms: 60_000 },
                _ => LlmError::RequestFailed(format!("{status}: {error_text}")),
            });
        }

        Ok(Box::pin(parse_chunk_stream(response.bytes_stream())))
    }
}

fn parse_chunk_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> impl futures::Stream<Item = LlmResult<StreamEvent>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        let mut aggregator = ToolCallAggregator::new();
        let mut content = String::new();
        let mut seen_index: std::collections::HashSet<usize> = std::collections::HashSet::new();
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

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    let tool_calls = std::mem::take(&mut aggregator).finish();
                    yield Ok(StreamEvent::StreamComplete(Message::assistant(content.clone(), tool_calls)));
                    completed = true;
                    continue;
                }
                if data.is_empty() {
                    continue;
                }

                let chunk: ChatChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(LlmError::InvalidResponse(e.to_string()));
                        return;
                    }
                };

                for choice in chunk.choices {
                    if let Some(text) = choice.delta.content {
                        content.push_str(&text);
                        yield Ok(StreamEvent::ContentDelta(text));
                    }
                    if let Some(reasoning) = choice.delta.reasoning {
                        yield Ok(StreamEvent::ReasoningDelta(reasoning));
                    }
                    for tc in choice.delta.tool_calls.unwrap_or_default() {
                        let index = tc.index;
                        if !seen_index.contains(&index) {
                            seen_index.insert(index);
                            let id = tc.id.clone().unwrap_or_default();
                            let name = tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default();
                            aggregator.start(index, id.clone(), name.clone());
                            yield Ok(StreamEvent::ToolCallStarted { index, id, name });
                        }
                        if let Some(function) = tc.function {
                            if let Some(fragment) = function.arguments {
                                aggregator.push_arguments(index, &fragment);
                            }
                        }
                    }
                }
            }
        }

        if !completed {
            let tool_calls = aggregator.finish();
            yield Ok(StreamEvent::StreamComplete(Message::assistant(content, tool_calls)));
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Serialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunctionCall,
}

#[derive(Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct ChatTool {
    r#type: String,
    function: ChatFunctionDef,
}

#[derive(Serialize)]
struct ChatFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    delta: ChatDelta,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatDeltaToolCall>>,
}

#[derive(Deserialize)]
struct ChatDeltaToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChatDeltaFunctionCall>,
}

#[derive(Deserialize, Default)]
struct ChatDeltaFunctionCall {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn chunk_body(lines: &[&str]) -> bytes::Bytes {
        let mut out = String::new();
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        bytes::Bytes::from(out)
    }

    #[tokio::test]
    async fn parses_text_deltas_and_done_sentinel() {
        let body = chunk_body(&[
            r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]);
        let stream = parse_chunk_stream(futures::stream::once(async move { Ok(body) }));
        tokio::pin!(stream);

        let mut final_content = None;
        while let Some(event) = stream.next().await {
            if let StreamEvent::StreamComplete(m) = event.unwrap() {
                final_content = Some(m.content);
            }
        }
        assert_eq!(final_content.unwrap(), "hello");
    }

    #[tokio::test]
    async fn accumulates_tool_call_arguments_by_index() {
        let body = chunk_body(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call-1","function":{"name":"echo","arguments":"{\"a\""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
            "data: [DONE]",
        ]);
        let stream = parse_chunk_stream(futures::stream::once(async move { Ok(body) }));
        tokio::pin!(stream);

        let mut final_message = None;
        while let Some(event) = stream.next().await {
            if let StreamEvent::StreamComplete(m) = event.unwrap() {
                final_message = Some(m);
            }
        }
        let m = final_message.unwrap();
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.tool_calls[0].arguments.get("a").unwrap(), 1);
    }
}
