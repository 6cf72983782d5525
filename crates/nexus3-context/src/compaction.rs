//! Compaction Engine: selects old messages for summarization, builds the
//! summarization prompt (redacted), and splices the synthetic summary
//! message back into history. The actual provider call is made by the
//! caller (the Session loop) — this module only builds and consumes text.

use chrono::Utc;
use nexus3_core::redaction::redact_secrets;
use nexus3_core::types::{Message, Role};

use crate::token_counter::TokenCounter;

pub const SUMMARIZE_PROMPT_PREAMBLE: &str = "\
Summarize the conversation below. Preserve:
- Key decisions made and their rationale
- Files created, read, or modified, and why
- Current task state and what remains to be done
- Any constraints or requirements the user stated
- Errors encountered and how they were resolved

Conversation:
";

#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub summary_message: Message,
    pub preserved_messages: Vec<Message>,
    pub original_token_count: usize,
    pub new_token_count: usize,
}

/// `[CONTEXT SUMMARY - Generated: YYYY-MM-DD HH:MM]`
pub fn summary_prefix() -> String {
    format!("[CONTEXT SUMMARY - Generated: {}]", Utc::now().format("%Y-%m-%d %H:%M"))
}

pub fn create_summary_message(summary_text: &str) -> Message {
    Message::user(format!("{}\n{}", summary_prefix(), summary_text))
}

/// Renders one message as a role-tagged line, with a `-> name(args)` line
/// per tool call on an Assistant message.
fn format_message(message: &Message) -> String {
    let mut lines = Vec::new();
    match message.role {
        Role::System => lines.push(format!("SYSTEM: {}", message.content)),
        Role::User => lines.push(format!("USER: {}", message.content)),
        Role::Assistant => {
            if !message.content.is_empty() {
                lines.push(format!("ASSISTANT: {}", message.content));
            }
            for tc in &message.tool_calls {
                let args = serde_json::Value::Object(tc.arguments.clone());
                lines.push(format!("-> {}({})", tc.name, args));
            }
        }
        Role::Tool => {
            let id = message.tool_call_id.as_deref().unwrap_or("?");
            lines.push(format!("TOOL[{id}]: {}", message.content));
        }
    }
    lines.join("\n")
}

pub fn format_messages_for_summary(messages: &[Message]) -> String {
    messages.iter().map(format_message).collect::<Vec<_>>().join("\n")
}

/// Builds the full prompt text to send to the summarizer, with secrets
/// redacted before it ever leaves the process.
pub fn build_summarize_prompt(messages: &[Message]) -> String {
    let conversation = format_messages_for_summary(messages);
    let redacted = redact_secrets(&conversation);
    format!("{SUMMARIZE_PROMPT_PREAMBLE}{redacted}\n\nSUMMARY:")
}

/// Walks newest→oldest, keeping messages under a budget of
/// `floor(available_budget * preserve_ratio)`, always keeping at least one
/// message. Returns `(to_summarize, preserved)` in original chronological
/// order.
pub fn select_messages_for_compaction(
    messages: &[Message],
    counter: &dyn TokenCounter,
    available_budget: usize,
    preserve_ratio: f64,
) -> (Vec<Message>, Vec<Message>) {
    let preserve_budget = ((available_budget as f64) * preserve_ratio).floor().max(0.0) as usize;

    let mut preserved_rev: Vec<Message> = Vec::new();
    let mut used = 0usize;

    for message in messages.iter().rev() {
        let tokens = counter.count_messages(std::slice::from_ref(message));
        if preserved_rev.is_empty() {
            preserved_rev.push(message.clone());
            used += tokens;
            continue;
        }
        if used + tokens > preserve_budget {
            break;
        }
        used += tokens;
        preserved_rev.push(message.clone());
    }

    let preserved_count = preserved_rev.len();
    preserved_rev.reverse();
    let preserved = preserved_rev;

    let to_summarize = messages[..messages.len() - preserved_count].to_vec();
    (to_summarize, preserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_counter::SimpleTokenCounter;
    use nexus3_core::types::ToolCall;

    #[test]
    fn summary_prefix_has_expected_format() {
        let prefix = summary_prefix();
        assert!(prefix.starts_with("[CONTEXT SUMMARY - Generated: "));
        assert!(prefix.ends_with(']'));
    }

    #[test]
    fn format_messages_uses_ascii_arrow_for_tool_calls() {
        let tc = ToolCall { id: "1".into(), name: "echo".into(), arguments: Default::default() };
        let msg = Message::assistant("", vec![tc]);
        let rendered = format_messages_for_summary(&[msg]);
        assert!(rendered.contains("-> echo("));
    }

    #[test]
    fn format_messages_tags_tool_results_with_call_id() {
        let msg = Message::tool("call-42", "result text");
        let rendered = format_messages_for_summary(&[msg]);
        assert!(rendered.contains("TOOL[call-42]: result text"));
    }

    #[test]
    fn build_prompt_redacts_secrets() {
        let msg = Message::user("api_key = sk-abcdefghijklmnopqrstuvwxyz123456789012345678");
        let prompt = build_summarize_prompt(&[msg]);
        assert!(!prompt.contains("abcdefghijklmnopqrstuvwxyz1234"));
        assert!(prompt.contains("[REDACTED]"));
    }

    #[test]
    fn select_keeps_at_least_one_message() {
        let counter = SimpleTokenCounter::new();
        let messages = vec![Message::user("a".repeat(1000))];
        let (to_summarize, preserved) = select_messages_for_compaction(&messages, &counter, 1, 0.5);
        assert!(to_summarize.is_empty());
        assert_eq!(preserved.len(), 1);
    }

    #[test]
    fn select_splits_oldest_into_to_summarize() {
        let counter = SimpleTokenCounter::new();
        let messages: Vec<Message> = (0..10)
            .map(|i| Message::user(format!("message number {i} with some padding text here")))
            .collect();
        let (to_summarize, preserved) = select_messages_for_compaction(&messages, &counter, 60, 1.0);
        assert!(!to_summarize.is_empty());
        assert!(!preserved.is_empty());
        assert_eq!(to_summarize.len() + preserved.len(), messages.len());
        // Preserved messages are the newest (tail) ones, in original order.
        assert_eq!(preserved.last().unwrap(), messages.last().unwrap());
    }
}
