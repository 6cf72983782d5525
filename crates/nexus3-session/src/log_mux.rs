//! Log Multiplexer (C9): the single callback object the LLM provider
//! sees, fanning requests/responses/chunks out to whichever agent's raw
//! sink is task-locally "current" — so one shared provider instance can
//! serve many concurrent agents without their logs crossing streams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::raw::{RawEntry, RawWriter};

tokio::task_local! {
    static CURRENT_AGENT_ID: String;
}

/// Registry of per-agent raw sinks, shared across every concurrent task
/// that might be driving a turn for any agent.
#[derive(Default, Clone)]
pub struct LogMultiplexer {
    callbacks: Arc<Mutex<HashMap<String, Arc<RawWriter>>>>,
}

impl LogMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<String>, writer: Arc<RawWriter>) {
        self.callbacks.lock().unwrap().insert(agent_id.into(), writer);
    }

    pub fn unregister(&self, agent_id: &str) {
        self.callbacks.lock().unwrap().remove(agent_id);
    }

    fn current_writer(&self) -> Option<Arc<RawWriter>> {
        let agent_id = CURRENT_AGENT_ID.try_with(|id| id.clone()).ok()?;
        self.callbacks.lock().unwrap().get(&agent_id).cloned()
    }

    /// Dispatches to `callbacks[current_agent_id]`'s writer. Unknown or
    /// unregistered ids, and calls made outside any `agent_context`
    /// scope, are a silent drop rather than an error.
    pub fn on_entry(&self, entry: &RawEntry) {
        if let Some(writer) = self.current_writer() {
            if let Err(e) = writer.write_entry(entry) {
                tracing::warn!(error = %e, "raw log write failed");
            }
        }
    }

    /// Runs `fut` with `agent_id` set as the task-local current agent for
    /// its duration. Stack-discipline and nestable: an inner scope's
    /// `agent_id` is visible only within it, and the outer scope resumes
    /// unchanged once the inner future completes — each `spawn`ed task
    /// gets an independent task-local, so concurrent agents never leak
    /// into each other's scope.
    pub async fn agent_context<F, T>(&self, agent_id: impl Into<String>, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CURRENT_AGENT_ID.scope(agent_id.into(), fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_writer(dir: &std::path::Path, name: &str) -> Arc<RawWriter> {
        Arc::new(RawWriter::open(dir.join(name)).unwrap())
    }

    #[tokio::test]
    async fn routes_to_the_current_agent_only() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMultiplexer::new();
        mux.register("agent-a", make_writer(dir.path(), "a.jsonl"));
        mux.register("agent-b", make_writer(dir.path(), "b.jsonl"));

        mux.clone()
            .agent_context("agent-a", async {
                mux.on_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({}) });
            })
            .await;

        let a_content = std::fs::read_to_string(dir.path().join("a.jsonl")).unwrap();
        let b_content = std::fs::read_to_string(dir.path().join("b.jsonl")).unwrap();
        assert_eq!(a_content.lines().count(), 1);
        assert_eq!(b_content.lines().count(), 0);
    }

    #[tokio::test]
    async fn unknown_agent_id_is_a_silent_drop() {
        let mux = LogMultiplexer::new();
        mux.agent_context("ghost", async {
            mux.on_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({}) });
        })
        .await;
        // No panic, no registered writer to check — absence of a crash is the assertion.
    }

    #[tokio::test]
    async fn no_scope_is_a_silent_drop() {
        let mux = LogMultiplexer::new();
        mux.on_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({}) });
    }

    #[tokio::test]
    async fn concurrent_agents_do_not_cross_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mux = LogMultiplexer::new();
        mux.register("agent-a", make_writer(dir.path(), "a.jsonl"));
        mux.register("agent-b", make_writer(dir.path(), "b.jsonl"));

        let counter = Arc::new(AtomicUsize::new(0));
        let mux_a = mux.clone();
        let mux_b = mux.clone();
        let c1 = counter.clone();
        let c2 = counter.clone();

        let h1 = tokio::spawn(async move {
            mux_a
                .agent_context("agent-a", async {
                    for _ in 0..20 {
                        mux_a.on_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({}) });
                        c1.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                    }
                })
                .await;
        });
        let h2 = tokio::spawn(async move {
            mux_b
                .agent_context("agent-b", async {
                    for _ in 0..20 {
                        mux_b.on_entry(&RawEntry::Request { timestamp: 1.0, body: serde_json::json!({}) });
                        c2.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                    }
                })
                .await;
        });

        h1.await.unwrap();
        h2.await.unwrap();

        let a_content = std::fs::read_to_string(dir.path().join("a.jsonl")).unwrap();
        let b_content = std::fs::read_to_string(dir.path().join("b.jsonl")).unwrap();
        assert_eq!(a_content.lines().count(), 20);
        assert_eq!(b_content.lines().count(), 20);
    }
}
