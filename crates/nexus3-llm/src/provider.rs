//! The abstract streaming provider trait. Every concrete provider accepts
//! an `LlmRequest` and returns a `LlmStream` of `nexus3_core::types::
//! StreamEvent` — the vocabulary the Session loop consumes, regardless of
//! which wire format produced it.

use std::pin::Pin;

use futures::Stream;
use nexus3_core::types::StreamEvent;
use serde::Serialize;

use crate::error::LlmResult;

#[derive(Clone, Debug, Serialize)]
pub struct LlmToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A request to a provider. `messages` are pre-rendered by the Context
/// Manager (`build_messages`); this crate does not know about Context.
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<nexus3_core::types::Message>,
    pub tools: Vec<LlmToolDef>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// `true` to use the streaming wire path; `false` for the Compaction
    /// Engine's single non-streaming summarization call (§4.5 step 4).
    pub stream: bool,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: "default-model".to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 8192,
            temperature: None,
            stream: true,
        }
    }
}

pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamEvent>> + Send>>;

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streaming completion. A cooperative cancellation token isn't
    /// threaded through here — the Session loop owns cancellation and just
    /// drops the stream (closing the underlying connection) once it
    /// observes its own token cancelled between events.
    async fn complete_stream(&self, request: LlmRequest) -> LlmResult<LlmStream>;

    /// Single non-streaming completion, used by the Compaction Engine to
    /// summarize. Default implementation drains `complete_stream` and
    /// concatenates content deltas, which is correct for any provider that
    /// doesn't offer a cheaper non-streaming endpoint.
    async fn complete_once(&self, mut request: LlmRequest) -> LlmResult<String> {
        use futures::StreamExt;
        request.stream = true;
        let mut stream = self.complete_stream(request).await?;
        let mut content = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::ContentDelta(text) => content.push_str(&text),
                StreamEvent::StreamComplete(_) => break,
                _ => {}
            }
        }
        Ok(content)
    }
}
