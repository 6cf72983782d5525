//! Pluggable text→token estimation. The default implementation is a
//! character heuristic (~4 chars/token) plus a fixed per-message overhead;
//! accuracy is advisory, the budget is a soft bound.

use nexus3_core::types::Message;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
    fn count_messages(&self, messages: &[Message]) -> usize;
}

/// Characters per token for the heuristic estimator.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed overhead added per message for role/formatting metadata the
/// character count alone doesn't capture.
const OVERHEAD_PER_MESSAGE: usize = 4;

#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleTokenCounter;

impl SimpleTokenCounter {
    pub fn new() -> Self {
        Self
    }
}

impl TokenCounter for SimpleTokenCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() / CHARS_PER_TOKEN).max(1)
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        let mut total = 0;
        for msg in messages {
            total += self.count(&msg.content) + OVERHEAD_PER_MESSAGE;
            for tc in &msg.tool_calls {
                total += self.count(&tc.name);
                let args = serde_json::Value::Object(tc.arguments.clone()).to_string();
                total += self.count(&args);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        let c = SimpleTokenCounter::new();
        assert_eq!(c.count(""), 0);
    }

    #[test]
    fn short_text_counts_at_least_one() {
        let c = SimpleTokenCounter::new();
        assert_eq!(c.count("hi"), 1);
    }

    #[test]
    fn messages_include_per_message_overhead() {
        let c = SimpleTokenCounter::new();
        let messages = vec![Message::user("hello world")];
        let expected = c.count("hello world") + OVERHEAD_PER_MESSAGE;
        assert_eq!(c.count_messages(&messages), expected);
    }

    #[test]
    fn tool_calls_contribute_name_and_arguments() {
        use nexus3_core::types::ToolCall;
        let c = SimpleTokenCounter::new();
        let mut args = serde_json::Map::new();
        args.insert("path".to_string(), serde_json::json!("/tmp/x"));
        let tc = ToolCall { id: "1".into(), name: "read_file".into(), arguments: args };
        let messages = vec![Message::assistant("", vec![tc])];
        assert!(c.count_messages(&messages) > OVERHEAD_PER_MESSAGE);
    }
}
