//! Accumulates a provider's incremental tool-call fragments (id/name set
//! once, `arguments` concatenated across chunks) into a fully-parsed
//! `ToolCall`. Shared by every concrete provider so the streaming-JSON
//! quirk is handled in exactly one place.

use nexus3_core::types::ToolCall;

/// Reserved key under which the raw, unparsed argument string is preserved
/// when the accumulated fragments don't parse as JSON. Never silently
/// substituted with `{}` — the skill layer may recover from, or report, the
/// raw text precisely.
pub const RAW_ARGUMENTS_KEY: &str = "_raw_arguments";

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// One aggregator instance per in-flight provider turn.
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    order: Vec<usize>,
    calls: std::collections::HashMap<usize, PendingCall>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `id`/`name` for `index` exactly once; a repeated start event for
    /// an index already seen (some providers resend the opening chunk) is
    /// ignored rather than clobbering accumulated arguments.
    pub fn start(&mut self, index: usize, id: String, name: String) {
        if self.calls.contains_key(&index) {
            return;
        }
        self.order.push(index);
        self.calls.insert(index, PendingCall { id, name, arguments: String::new() });
    }

    pub fn push_arguments(&mut self, index: usize, fragment: &str) {
        if let Some(call) = self.calls.get_mut(&index) {
            call.arguments.push_str(fragment);
        }
    }

    /// Finalizes every started call, in start order, parsing each one's
    /// concatenated argument fragments as JSON. A parse failure preserves
    /// the raw text under `_raw_arguments` rather than substituting `{}`.
    pub fn finish(self) -> Vec<ToolCall> {
        self.order
            .into_iter()
            .filter_map(|idx| self.calls.get(&idx))
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    serde_json::Map::new()
                } else {
                    match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                        Ok(serde_json::Value::Object(map)) => map,
                        Ok(other) => {
                            let mut map = serde_json::Map::new();
                            map.insert("value".to_string(), other);
                            map
                        }
                        Err(e) => {
                            tracing::warn!(
                                tool = %call.name,
                                error = %e,
                                "tool call arguments failed to parse as JSON, preserving raw text"
                            );
                            let mut map = serde_json::Map::new();
                            map.insert(
                                RAW_ARGUMENTS_KEY.to_string(),
                                serde_json::Value::String(call.arguments.clone()),
                            );
                            map
                        }
                    }
                };
                ToolCall { id: call.id.clone(), name: call.name.clone(), arguments }
            })
            .collect()
    }
}
