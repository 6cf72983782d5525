//! Cross-module tests for nexus3-llm that don't require network access.

use nexus3_core::types::{Message, StreamEvent};
use nexus3_llm::provider::{LlmRequest, LlmToolDef};
use nexus3_llm::{AnthropicProvider, LlmProvider};

#[test]
fn llm_request_default_is_streaming() {
    let req = LlmRequest::default();
    assert!(req.stream);
    assert!(req.messages.is_empty());
    assert!(req.tools.is_empty());
}

#[test]
fn tool_def_serializes_with_input_schema() {
    let tool = LlmToolDef {
        name: "echo".into(),
        description: "Echoes input".into(),
        input_schema: serde_json::json!({"type": "object"}),
    };
    let json = serde_json::to_string(&tool).unwrap();
    assert!(json.contains("input_schema"));
}

#[test]
fn anthropic_provider_name() {
    let provider = AnthropicProvider::new("fake-key");
    assert_eq!(provider.name(), "anthropic");
}

#[tokio::test]
async fn complete_once_concatenates_content_deltas_from_a_stream() {
    use futures::stream;
    use nexus3_llm::error::LlmResult;
    use nexus3_llm::provider::LlmStream;

    struct FakeProvider;

    #[async_trait::async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete_stream(&self, _request: LlmRequest) -> LlmResult<LlmStream> {
            let events: Vec<LlmResult<StreamEvent>> = vec![
                Ok(StreamEvent::ContentDelta("hel".into())),
                Ok(StreamEvent::ContentDelta("lo".into())),
                Ok(StreamEvent::StreamComplete(Message::assistant("hello", vec![]))),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    let provider = FakeProvider;
    let text = provider.complete_once(LlmRequest::default()).await.unwrap();
    assert_eq!(text, "hello");
}
