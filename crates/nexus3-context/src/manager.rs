//! Context Manager: bounded conversation history with structural-integrity-
//! preserving truncation.

use std::sync::Arc;

use chrono::Utc;
use nexus3_core::types::{Message, Role, ToolResult};

use crate::token_counter::TokenCounter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationStrategy {
    OldestFirst,
    MiddleOut,
}

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
    pub truncation_strategy: TruncationStrategy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { max_tokens: 8000, reserve_tokens: 2000, truncation_strategy: TruncationStrategy::OldestFirst }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub system: usize,
    pub tools: usize,
    pub messages: usize,
    pub total: usize,
    pub budget: usize,
    pub available: i64,
}

/// A contiguous run of messages that must be kept or dropped as a whole: a
/// lone message, or an Assistant-with-tool_calls followed by every Tool
/// message that answers one of its calls.
enum Unit {
    Single(Message),
    Group(Vec<Message>),
}

impl Unit {
    fn messages(&self) -> &[Message] {
        match self {
            Unit::Single(m) => std::slice::from_ref(m),
            Unit::Group(g) => g,
        }
    }

    fn into_messages(self) -> Vec<Message> {
        match self {
            Unit::Single(m) => vec![m],
            Unit::Group(g) => g,
        }
    }
}

fn group_into_units(messages: &[Message]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        if m.role == Role::Assistant && !m.tool_calls.is_empty() {
            let mut pending: std::collections::HashSet<&str> =
                m.tool_calls.iter().map(|tc| tc.id.as_str()).collect();
            let mut group = vec![m.clone()];
            let mut j = i + 1;
            while j < messages.len() && !pending.is_empty() {
                let next = &messages[j];
                let matches = next.role == Role::Tool
                    && next.tool_call_id.as_deref().map(|id| pending.contains(id)).unwrap_or(false);
                if !matches {
                    break;
                }
                pending.remove(next.tool_call_id.as_deref().unwrap());
                group.push(next.clone());
                j += 1;
            }
            units.push(Unit::Group(group));
            i = j;
        } else {
            units.push(Unit::Single(m.clone()));
            i += 1;
        }
    }
    units
}

fn flatten(units: Vec<Unit>) -> Vec<Message> {
    units.into_iter().flat_map(Unit::into_messages).collect()
}

/// Inserts the current date/time after the first line that is exactly
/// `# Environment` (anchored, not a substring match — the literal text may
/// legitimately appear elsewhere in the prompt). Appends a fresh section at
/// the end if no such header line exists.
fn inject_environment_datetime(template: &str, now: chrono::DateTime<Utc>) -> String {
    const HEADER: &str = "# Environment";
    let stamp = format!("Current date/time: {}", now.format("%Y-%m-%d %H:%M:%S UTC"));

    let mut lines: Vec<&str> = template.lines().collect();
    if let Some(idx) = lines.iter().position(|l| *l == HEADER) {
        let mut out: Vec<String> = lines[..=idx].iter().map(|s| s.to_string()).collect();
        out.push(stamp);
        out.extend(lines[idx + 1..].iter().map(|s| s.to_string()));
        out.join("\n")
    } else {
        lines.push("");
        let mut out: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        out.push(HEADER.to_string());
        out.push(stamp);
        out.join("\n")
    }
}

pub struct ContextManager {
    config: ContextConfig,
    token_counter: Arc<dyn TokenCounter>,
    system_prompt_template: String,
    tool_definitions: Vec<serde_json::Value>,
    messages: Vec<Message>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, token_counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            config,
            token_counter,
            system_prompt_template: String::new(),
            tool_definitions: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt_template = prompt.into();
    }

    pub fn system_prompt(&self) -> String {
        inject_environment_datetime(&self.system_prompt_template, Utc::now())
    }

    pub fn set_tool_definitions(&mut self, defs: Vec<serde_json::Value>) {
        self.tool_definitions = defs;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn token_counter(&self) -> &Arc<dyn TokenCounter> {
        &self.token_counter
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Rejects empty-content, no-tool-calls messages: the empty-assistant
    /// guard. Logs a warning and does nothing rather than polluting history.
    pub fn add_assistant_message(&mut self, message: Message) {
        if message.is_empty_assistant() {
            tracing::warn!("dropping empty assistant message (no content, no tool_calls)");
            return;
        }
        self.messages.push(message);
    }

    pub fn add_tool_result(&mut self, tool_call_id: impl Into<String>, name: &str, result: &ToolResult) {
        let _ = name;
        self.messages.push(Message::tool(tool_call_id, result.to_content()));
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Drops the most recently appended message if present. Used by the
    /// Session loop to roll back an assistant turn whose tool_calls were
    /// cancelled mid-dispatch, so Context never holds an assistant message
    /// with no matching tool results (see the cancellation "never half"
    /// guarantee).
    pub fn pop_last_message(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Atomically replaces history with `summary` followed by `preserved`
    /// (Compaction Engine, §4.5 step 6). The system prompt is not part of
    /// `self.messages` and is unaffected — it is re-prepended on the next
    /// `build_messages` call as usual.
    pub fn replace_with_summary(&mut self, summary: Message, preserved: Vec<Message>) {
        let mut out = Vec::with_capacity(preserved.len() + 1);
        out.push(summary);
        out.extend(preserved);
        self.messages = out;
    }

    fn tools_tokens(&self) -> usize {
        self.tool_definitions
            .iter()
            .map(|d| self.token_counter.count(&d.to_string()))
            .sum()
    }

    pub fn get_token_usage(&self) -> TokenUsage {
        let system = self.token_counter.count(&self.system_prompt());
        let tools = self.tools_tokens();
        let messages = self.token_counter.count_messages(&self.messages);
        let total = system + tools + messages;
        let budget = self.config.max_tokens.saturating_sub(self.config.reserve_tokens);
        let available = budget as i64 - total as i64;
        TokenUsage { system, tools, messages, total, budget, available }
    }

    pub fn is_over_budget(&self) -> bool {
        self.get_token_usage().available < 0
    }

    /// Produces the ordered list to send to the provider: the rendered
    /// system prompt followed by the (possibly truncated) message history.
    /// Also resyncs `self.messages` to the truncated set so a second call
    /// converges to the same output (idempotence).
    pub fn build_messages(&mut self) -> Vec<Message> {
        if self.is_over_budget() {
            let usage = self.get_token_usage();
            let available_for_history = (self.config.max_tokens as i64
                - self.config.reserve_tokens as i64
                - usage.system as i64
                - usage.tools as i64)
                .max(0) as usize;
            let truncated = match self.config.truncation_strategy {
                TruncationStrategy::OldestFirst => truncate_oldest_first(&self.messages, &*self.token_counter, available_for_history),
                TruncationStrategy::MiddleOut => truncate_middle_out(&self.messages, &*self.token_counter, available_for_history),
            };
            self.messages = truncated;
        }

        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(Message::system(self.system_prompt()));
        out.extend(self.messages.clone());
        out
    }

    pub fn get_tool_definitions(&self) -> &[serde_json::Value] {
        &self.tool_definitions
    }
}

fn truncate_oldest_first(messages: &[Message], counter: &dyn TokenCounter, budget: usize) -> Vec<Message> {
    let units = group_into_units(messages);
    let mut kept_rev: Vec<Unit> = Vec::new();
    let mut used = 0usize;

    for unit in units.into_iter().rev() {
        let tokens = counter.count_messages(unit.messages());
        if kept_rev.is_empty() {
            // Always keep at least one unit even if it alone overflows.
            kept_rev.push(unit);
            used += tokens;
            continue;
        }
        if used + tokens > budget {
            break;
        }
        used += tokens;
        kept_rev.push(unit);
    }

    kept_rev.reverse();
    flatten(kept_rev)
}

fn truncate_middle_out(messages: &[Message], counter: &dyn TokenCounter, budget: usize) -> Vec<Message> {
    let units = group_into_units(messages);
    if units.len() <= 2 {
        return flatten(units);
    }

    let last_idx = units.len() - 1;
    let first_tokens = counter.count_messages(units[0].messages());
    let last_tokens = counter.count_messages(units[last_idx].messages());
    let mut used = first_tokens + last_tokens;

    let mut middle_kept: Vec<usize> = Vec::new();
    for idx in (1..last_idx).rev() {
        let tokens = counter.count_messages(units[idx].messages());
        if used + tokens > budget {
            continue;
        }
        used += tokens;
        middle_kept.push(idx);
    }
    middle_kept.sort_unstable();

    let mut result = Vec::new();
    let mut units = units;
    // Drain in index order, consuming from the original vector by index.
    let mut keep_indices: Vec<usize> = vec![0];
    keep_indices.extend(middle_kept);
    keep_indices.push(last_idx);

    let mut taken: Vec<Option<Unit>> = units.drain(..).map(Some).collect();
    for idx in keep_indices {
        if let Some(unit) = taken[idx].take() {
            result.push(unit);
        }
    }
    flatten(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_counter::SimpleTokenCounter;
    use nexus3_core::types::ToolCall;

    fn manager(max_tokens: usize) -> ContextManager {
        ContextManager::new(
            ContextConfig { max_tokens, reserve_tokens: 0, truncation_strategy: TruncationStrategy::OldestFirst },
            Arc::new(SimpleTokenCounter::new()),
        )
    }

    #[test]
    fn empty_assistant_guard_rejects_truly_empty_message() {
        let mut ctx = manager(8000);
        ctx.add_assistant_message(Message::assistant("", vec![]));
        assert!(ctx.messages().is_empty());
    }

    #[test]
    fn build_messages_prepends_system_prompt() {
        let mut ctx = manager(8000);
        ctx.set_system_prompt("Be brief.");
        ctx.add_user_message("hi");
        let built = ctx.build_messages();
        assert_eq!(built[0].role, Role::System);
        assert!(built[0].content.starts_with("Be brief."));
    }

    #[test]
    fn environment_header_gets_datetime_inserted_after_it() {
        let mut ctx = manager(8000);
        ctx.set_system_prompt("intro\n# Environment\nmore stuff");
        let rendered = ctx.system_prompt();
        let lines: Vec<&str> = rendered.lines().collect();
        let header_idx = lines.iter().position(|l| *l == "# Environment").unwrap();
        assert!(lines[header_idx + 1].starts_with("Current date/time:"));
    }

    #[test]
    fn environment_header_as_substring_elsewhere_is_not_matched() {
        let mut ctx = manager(8000);
        ctx.set_system_prompt("See also: # Environment (mentioned in passing)");
        let rendered = ctx.system_prompt();
        // The substring occurrence is left untouched; a fresh section with
        // its own exact `# Environment` header line is appended at the end.
        assert!(rendered.contains("See also: # Environment (mentioned in passing)"));
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines.iter().any(|l| *l == "# Environment"));
        assert!(rendered.trim_end().contains("Current date/time:"));
    }

    #[test]
    fn missing_environment_header_appends_new_section() {
        let mut ctx = manager(8000);
        ctx.set_system_prompt("just a prompt");
        let rendered = ctx.system_prompt();
        assert!(rendered.contains("# Environment"));
        assert!(rendered.contains("Current date/time:"));
    }

    #[test]
    fn truncation_preserves_tool_call_groups() {
        let mut ctx = manager(200);
        for i in 0..20 {
            ctx.add_user_message(format!("filler message number {i} with some padding text"));
        }
        let tc = ToolCall { id: "call-1".into(), name: "echo".into(), arguments: Default::default() };
        ctx.add_assistant_message(Message::assistant("", vec![tc]));
        ctx.add_tool_result("call-1", "echo", &ToolResult::ok("echoed"));
        for i in 0..20 {
            ctx.add_user_message(format!("more filler message {i} with padding"));
        }

        let built = ctx.build_messages();
        let has_orphan_tool = built.iter().any(|m| {
            m.role == Role::Tool
                && !built.iter().any(|other| {
                    other.role == Role::Assistant
                        && other.tool_calls.iter().any(|tc| Some(tc.id.as_str()) == m.tool_call_id.as_deref())
                })
        });
        assert!(!has_orphan_tool, "no Tool message should survive without its originating Assistant call");

        let has_orphan_assistant = built.iter().any(|m| {
            m.role == Role::Assistant
                && !m.tool_calls.is_empty()
                && !m.tool_calls.iter().all(|tc| {
                    built.iter().any(|other| {
                        other.role == Role::Tool && other.tool_call_id.as_deref() == Some(tc.id.as_str())
                    })
                })
        });
        assert!(!has_orphan_assistant, "no Assistant+tool_calls should survive without all its Tool results");
    }

    #[test]
    fn build_messages_is_idempotent_after_truncation() {
        let mut ctx = manager(150);
        for i in 0..40 {
            ctx.add_user_message(format!("message {i} with enough padding to cost real tokens"));
        }
        let first = ctx.build_messages();
        let second = ctx.build_messages();
        assert_eq!(first, second);
    }

    #[test]
    fn replace_with_summary_splices_summary_ahead_of_preserved() {
        let mut ctx = manager(8000);
        ctx.add_user_message("one");
        ctx.add_user_message("two");
        ctx.add_user_message("three");

        let summary = Message::user("[CONTEXT SUMMARY - Generated: 2026-01-01 00:00]\ncondensed");
        let preserved = vec![Message::user("three")];
        ctx.replace_with_summary(summary.clone(), preserved);

        assert_eq!(ctx.messages().len(), 2);
        assert_eq!(ctx.messages()[0].content, summary.content);
        assert_eq!(ctx.messages()[1].content, "three");
    }

    #[test]
    fn middle_out_keeps_first_and_last_unconditionally() {
        let mut ctx = ContextManager::new(
            ContextConfig { max_tokens: 120, reserve_tokens: 0, truncation_strategy: TruncationStrategy::MiddleOut },
            Arc::new(SimpleTokenCounter::new()),
        );
        ctx.add_user_message("first message in the conversation");
        for i in 0..30 {
            ctx.add_user_message(format!("middle filler {i} padding padding padding"));
        }
        ctx.add_user_message("last message in the conversation");

        let built = ctx.build_messages();
        assert_eq!(built[1].content, "first message in the conversation");
        assert_eq!(built.last().unwrap().content, "last message in the conversation");
    }
}
