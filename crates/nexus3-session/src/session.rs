//! Session (agent loop) (C10): the tool-use state machine driving one
//! agent's turns. `send` streams assistant content deltas while running
//! the provider/tool loop underneath; `cancel` flips the in-flight turn's
//! token.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::{Stream, StreamExt};
use nexus3_core::types::{ConfirmationResult, Message, ToolCall, ToolOverride, ToolResult};
use nexus3_core::CancellationToken;
use nexus3_context::ContextManager;
use nexus3_llm::provider::{LlmProvider, LlmRequest, LlmToolDef};
use nexus3_skills::registry::SkillRegistry;
use serde_json::Value;

use crate::log_mux::LogMultiplexer;
use crate::markdown::MarkdownWriter;
use crate::raw::RawEntry;
use crate::storage::SessionStorage;

/// Internal iteration cap for one `send()` call. The serve-mode
/// `nexus_send` skill layers its own, much larger re-invocation budget on
/// top of this (see `nexus3-skills::builtin::pool`); the two are distinct
/// bounds at different levels of the stack.
pub const MAX_TOOL_ITERATIONS: usize = 10;

pub const ITERATION_LIMIT_SENTINEL: &str = "[Max tool iterations reached]";

#[async_trait::async_trait]
pub trait ConfirmationProvider: Send + Sync {
    async fn confirm(&self, tool_call: &ToolCall) -> ConfirmationResult;
}

/// The default when no confirmation provider is wired: HTTP mode never
/// prompts, so a destructive call requiring confirmation without an
/// injected provider is refused outright rather than blocking forever.
pub struct AutoDenyConfirmation;

#[async_trait::async_trait]
impl ConfirmationProvider for AutoDenyConfirmation {
    async fn confirm(&self, _tool_call: &ToolCall) -> ConfirmationResult {
        ConfirmationResult::Deny
    }
}

pub trait SessionObserver: Send + Sync {
    fn on_reasoning_delta(&self, _delta: &str) {}
    fn on_tool_call_started(&self, _index: usize, _id: &str, _name: &str) {}
}

pub struct NoopObserver;
impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_id: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub default_tool_timeout_ms: u64,
    pub max_tool_iterations: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            model: "default-model".to_string(),
            max_tokens: 8192,
            temperature: None,
            default_tool_timeout_ms: 30_000,
            max_tool_iterations: MAX_TOOL_ITERATIONS,
        }
    }
}

pub struct Session {
    config: SessionConfig,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<SkillRegistry>,
    context: Mutex<ContextManager>,
    /// `None` means no Permission Policy was wired into this Session's
    /// services bag; every tool dispatch must then fail closed rather than
    /// silently permit the call.
    policy: Mutex<Option<nexus3_core::permission::PermissionPolicy>>,
    token: Mutex<CancellationToken>,
    log_mux: LogMultiplexer,
    /// `context.md` transcript (C8). `None` is a valid, silent no-op —
    /// nothing in the Context stream requires a file sink to exist.
    markdown: Mutex<Option<MarkdownWriter>>,
    confirmation: Arc<dyn ConfirmationProvider>,
    observer: Arc<dyn SessionObserver>,
    halted_at_iteration_limit: AtomicBool,
    /// `None` means this Session was built without a Session Storage
    /// handle (e.g. most unit tests); `compact` is then a documented no-op
    /// rather than a failure, since there is no id-bearing row set to
    /// reconcile against.
    storage: Mutex<Option<Arc<SessionStorage>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<SkillRegistry>,
        context: ContextManager,
        policy: nexus3_core::permission::PermissionPolicy,
        log_mux: LogMultiplexer,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
            context: Mutex::new(context),
            policy: Mutex::new(Some(policy)),
            token: Mutex::new(CancellationToken::new()),
            log_mux,
            markdown: Mutex::new(None),
            confirmation: Arc::new(AutoDenyConfirmation),
            observer: Arc::new(NoopObserver),
            halted_at_iteration_limit: AtomicBool::new(false),
            storage: Mutex::new(None),
        }
    }

    pub fn with_confirmation(mut self, provider: Arc<dyn ConfirmationProvider>) -> Self {
        self.confirmation = provider;
        self
    }

    /// Wires a Session Storage handle so `compact` can reconcile its
    /// id-bearing rows against the in-memory Context splice (§4.5 step 6).
    pub fn with_storage(mut self, storage: Arc<SessionStorage>) -> Self {
        self.storage = Mutex::new(Some(storage));
        self
    }

    /// Strips the wired Permission Policy back out, so every subsequent
    /// tool dispatch fails closed (H3/I6). Exists for the services bag
    /// never actually omitting a policy in practice, but the loop's
    /// fail-closed behavior still needs to be exercised directly.
    pub fn without_policy(mut self) -> Self {
        *self.policy.get_mut().unwrap() = None;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_markdown_writer(mut self, writer: MarkdownWriter) -> Self {
        let system_prompt = self.context.lock().unwrap().system_prompt();
        if !system_prompt.is_empty() {
            if let Err(e) = writer.write_system(&system_prompt) {
                tracing::warn!(agent_id = %self.config.agent_id, error = %e, "failed to write context.md header");
            }
        }
        self.markdown = Mutex::new(Some(writer));
        self
    }

    fn write_markdown(&self, message: &Message) {
        let guard = self.markdown.lock().unwrap();
        if let Some(writer) = guard.as_ref() {
            if let Err(e) = writer.write_message(message) {
                tracing::warn!(agent_id = %self.config.agent_id, error = %e, "failed to write context.md entry");
            }
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn halted_at_iteration_limit(&self) -> bool {
        self.halted_at_iteration_limit.load(Ordering::SeqCst)
    }

    /// Flips the session's current token. Racing with completion is
    /// expected: the loop re-checks the token between events and before
    /// every tool dispatch, so a cancel that arrives just as a turn
    /// finishes is simply a no-op.
    pub fn cancel(&self) {
        self.token.lock().unwrap().cancel();
    }

    fn fresh_token(&self) -> CancellationToken {
        let mut guard = self.token.lock().unwrap();
        *guard = CancellationToken::new();
        guard.clone()
    }

    pub fn context_snapshot(&self) -> Vec<Message> {
        self.context.lock().unwrap().messages().to_vec()
    }

    pub fn token_usage(&self) -> nexus3_context::manager::TokenUsage {
        self.context.lock().unwrap().get_token_usage()
    }

    pub fn system_prompt(&self) -> String {
        self.context.lock().unwrap().system_prompt()
    }

    /// Runs the Compaction Engine (§4.5) against this Session's current
    /// Context and wired Storage. Typically invoked by the caller when
    /// `token_usage().available` drops below a threshold (compaction is
    /// triggered externally, not on every turn). Returns `Ok(false)` with
    /// no effect if no Storage is wired or nothing is worth summarizing.
    pub async fn compact(&self, preserve_ratio: f64) -> crate::error::Result<bool> {
        let storage = { self.storage.lock().unwrap().clone() };
        let Some(storage) = storage else {
            return Ok(false);
        };

        // Extract what the engine needs and release the Context lock
        // before the storage/provider round-trips below — holding a
        // synchronous Mutex guard across those `.await`s would block every
        // other reader of Context for the duration of the summarization
        // call.
        let (counter, budget) = {
            let ctx = self.context.lock().unwrap();
            (ctx.token_counter().clone(), ctx.get_token_usage().budget)
        };

        let outcome = crate::compaction::run_compaction(
            self.provider.as_ref(),
            &self.config.model,
            &storage,
            counter.as_ref(),
            budget,
            preserve_ratio,
        )
        .await?;

        let Some(result) = outcome else {
            return Ok(false);
        };
        {
            let mut ctx = self.context.lock().unwrap();
            ctx.replace_with_summary(result.summary_message, result.preserved_messages);
        }
        Ok(true)
    }

    /// `Trusted` when no policy is wired, matching the fail-open default a
    /// freshly-restored session without an explicit preset would get.
    pub fn permission_level(&self) -> nexus3_core::types::PermissionLevel {
        self.policy.lock().unwrap().as_ref().map(|p| p.level()).unwrap_or(nexus3_core::types::PermissionLevel::Trusted)
    }

    pub fn disabled_tools(&self) -> Vec<String> {
        self.policy
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| {
                p.permissions()
                    .tool_overrides
                    .iter()
                    .filter(|(_, o)| o.enabled == Some(false))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tool_definitions(&self) -> Vec<LlmToolDef> {
        self.registry
            .list()
            .into_iter()
            .filter_map(|name| {
                let skill = self.registry.get(name)?;
                Some(LlmToolDef {
                    name: skill.name().to_string(),
                    description: skill.description().to_string(),
                    input_schema: skill.parameters(),
                })
            })
            .collect()
    }

    /// Appends the user message to Context and drives the tool loop,
    /// yielding each assistant content delta as it arrives from the
    /// provider (not buffered until the turn completes). Nothing further is
    /// produced after a cancellation or a hit on the iteration cap beyond
    /// the sentinel.
    pub fn send<'a>(&'a self, user_input: String) -> impl Stream<Item = String> + 'a {
        let token = self.fresh_token();
        self.halted_at_iteration_limit.store(false, Ordering::SeqCst);

        stream! {
            {
                let mut ctx = self.context.lock().unwrap();
                ctx.add_user_message(user_input.clone());
            }
            self.write_markdown(&Message::user(user_input));

            for _ in 0..self.config.max_tool_iterations {
                if token.raise_if_cancelled().is_err() {
                    return;
                }

                let (content_tx, mut content_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
                let turn_future = self.run_one_turn(&token, content_tx);
                tokio::pin!(turn_future);

                let mut turn_outcome: Option<Result<TurnResult, ()>> = None;
                let mut channel_open = true;

                // Drives the provider turn to completion while forwarding
                // each content delta the instant it arrives; `select!`'s
                // arms only record which side fired (never yield directly
                // from inside the macro), so the actual `yield` stays in
                // plain statement position below, where async-stream's
                // transform can see it.
                while turn_outcome.is_none() {
                    let delta = if channel_open {
                        tokio::select! {
                            biased;
                            maybe_delta = content_rx.recv() => match maybe_delta {
                                Some(d) => Some(d),
                                None => {
                                    channel_open = false;
                                    None
                                }
                            },
                            res = &mut turn_future => {
                                turn_outcome = Some(res);
                                None
                            }
                        }
                    } else {
                        turn_outcome = Some((&mut turn_future).await);
                        None
                    };

                    if let Some(delta) = delta {
                        yield delta;
                    }
                }
                // Drain whatever deltas are already queued but not yet
                // consumed by the loop above.
                while let Ok(delta) = content_rx.try_recv() {
                    yield delta;
                }

                let turn_result = match turn_outcome.unwrap() {
                    Ok(outcome) => outcome,
                    Err(_) => return,
                };

                let assistant_message = match turn_result {
                    TurnResult::Cancelled => return,
                    TurnResult::EmptyAssistant => return,
                    TurnResult::Message(message) => message,
                };

                if assistant_message.tool_calls.is_empty() {
                    return;
                }

                if token.raise_if_cancelled().is_err() {
                    return;
                }

                let results = self.execute_tool_calls(&assistant_message.tool_calls, &token).await;

                // A cancellation observed mid-batch means some siblings may
                // have been skipped or only partially run; per the
                // cancellation contract we leave Context exactly as it was
                // before this batch (rolling back the assistant message
                // that introduced these tool_calls) rather than appending a
                // mixed or incomplete result set.
                if token.raise_if_cancelled().is_err() {
                    self.context.lock().unwrap().pop_last_message();
                    return;
                }

                {
                    let mut ctx = self.context.lock().unwrap();
                    for (call, result) in &results {
                        ctx.add_tool_result(call.id.clone(), &call.name, result);
                    }
                }
                for (call, result) in &results {
                    let guard = self.markdown.lock().unwrap();
                    if let Some(writer) = guard.as_ref() {
                        if let Err(e) = writer.write_tool_result(&call.name, result) {
                            tracing::warn!(agent_id = %self.config.agent_id, error = %e, "failed to write context.md entry");
                        }
                    }
                }
            }

            self.halted_at_iteration_limit.store(true, Ordering::SeqCst);
            tracing::warn!(agent_id = %self.config.agent_id, "hit max tool iterations");
            yield ITERATION_LIMIT_SENTINEL.to_string();
        }
    }

    /// Runs exactly one provider turn: builds the request, streams it under
    /// the Log Multiplexer's agent scope, forwarding each assistant content
    /// delta to `content_tx` as it arrives, and returns the assembled
    /// assistant message (or a cancellation/empty-assistant outcome).
    async fn run_one_turn(
        &self,
        token: &CancellationToken,
        content_tx: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Result<TurnResult, ()> {
        let request = {
            let mut ctx = self.context.lock().unwrap();
            LlmRequest {
                model: self.config.model.clone(),
                messages: ctx.build_messages(),
                tools: self.tool_definitions(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
                stream: true,
            }
        };

        let agent_id = self.config.agent_id.clone();
        let provider = self.provider.clone();
        let mux_scope = self.log_mux.clone();
        let mux = self.log_mux.clone();
        let token_for_scope = token.clone();

        mux_scope.agent_context(agent_id.clone(), async move {
            mux.on_entry(&RawEntry::Request {
                timestamp: unix_timestamp(),
                body: serde_json::json!({"model": request.model, "max_tokens": request.max_tokens}),
            });

            let started = Instant::now();
            let mut stream = match provider.complete_stream(request).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "provider stream failed to open");
                    return Ok(TurnResult::EmptyAssistant);
                }
            };

            let mut buffered_content = String::new();
            let mut event_count: u64 = 0;
            let mut tool_call_count: u64 = 0;
            let mut received_done = false;
            let mut final_message: Option<Message> = None;

            loop {
                if token_for_scope.raise_if_cancelled().is_err() {
                    drop(stream);
                    return Ok(TurnResult::Cancelled);
                }

                let next = stream.next().await;
                let event = match next {
                    None => break,
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "provider stream error");
                        break;
                    }
                };
                event_count += 1;

                match &event {
                    nexus3_core::types::StreamEvent::ContentDelta(_) => {}
                    nexus3_core::types::StreamEvent::ToolCallStarted { .. } => {
                        tool_call_count += 1;
                    }
                    nexus3_core::types::StreamEvent::StreamComplete(_) => {
                        received_done = true;
                    }
                    _ => {}
                }

                mux.on_entry(&RawEntry::StreamChunk {
                    timestamp: unix_timestamp(),
                    chunk: stream_event_to_json(&event),
                });

                match event {
                    nexus3_core::types::StreamEvent::ContentDelta(delta) => {
                        buffered_content.push_str(&delta);
                        // Receiver is the send() loop's select!; if it has
                        // already dropped (stream consumer gone) there is
                        // nothing useful to do with the send failure.
                        let _ = content_tx.send(delta);
                    }
                    nexus3_core::types::StreamEvent::ReasoningDelta(delta) => {
                        self.observer.on_reasoning_delta(&delta);
                    }
                    nexus3_core::types::StreamEvent::ToolCallStarted { index, id, name } => {
                        self.observer.on_tool_call_started(index, &id, &name);
                    }
                    nexus3_core::types::StreamEvent::StreamComplete(message) => {
                        final_message = Some(message);
                        break;
                    }
                }
            }

            mux.on_entry(&RawEntry::StreamComplete {
                timestamp: unix_timestamp(),
                event_count,
                content_length: buffered_content.len() as u64,
                tool_call_count,
                received_done,
                finish_reason: None,
                http_status: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });

            let Some(message) = final_message else {
                return Ok(TurnResult::EmptyAssistant);
            };

            if message.is_empty_assistant() {
                tracing::warn!(agent_id = %self.config.agent_id, "provider returned an empty assistant turn");
                return Ok(TurnResult::EmptyAssistant);
            }

            {
                let mut ctx = self.context.lock().unwrap();
                ctx.add_assistant_message(message.clone());
            }
            self.write_markdown(&message);
            Ok(TurnResult::Message(message))
        })
        .await
    }

    /// Runs every tool call in `tool_calls`, in sequence (halting remaining
    /// siblings after the first failure) unless every call in the batch
    /// opts into `_parallel`, in which case all siblings run concurrently
    /// regardless of individual outcomes.
    async fn execute_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        token: &CancellationToken,
    ) -> Vec<(ToolCall, ToolResult)> {
        if is_parallel_batch(tool_calls) {
            let futures = tool_calls.iter().map(|call| self.execute_one_tool(call, token));
            let results = futures::future::join_all(futures).await;
            tool_calls.iter().cloned().zip(results).collect()
        } else {
            let mut out = Vec::with_capacity(tool_calls.len());
            let mut halted = false;
            for call in tool_calls {
                if halted {
                    out.push((call.clone(), ToolResult::err("halted: a preceding tool call in this batch failed")));
                    continue;
                }
                if token.raise_if_cancelled().is_err() {
                    out.push((call.clone(), ToolResult::err("cancelled")));
                    continue;
                }
                let result = self.execute_one_tool(call, token).await;
                if !result.success() {
                    halted = true;
                }
                out.push((call.clone(), result));
            }
            out
        }
    }

    async fn execute_one_tool(&self, call: &ToolCall, token: &CancellationToken) -> ToolResult {
        if token.raise_if_cancelled().is_err() {
            return ToolResult::err("cancelled");
        }

        if self.registry.get(&call.name).is_none() {
            return ToolResult::err(format!("Unknown skill: {}", call.name));
        }

        let allowed = {
            let policy = self.policy.lock().unwrap();
            match policy.as_ref() {
                Some(p) => p.allows_action(&call.name),
                // Fail-closed (H3/I6): no wired policy permits nothing.
                None => {
                    return ToolResult::err(format!(
                        "no permission policy wired for this session; refusing '{}'",
                        call.name
                    ))
                }
            }
        };
        if !allowed {
            return ToolResult::err(format!("Tool disabled: {}", call.name));
        }

        let needs_confirmation = {
            let policy = self.policy.lock().unwrap();
            policy.as_ref().map(|p| p.requires_confirmation(&call.name)).unwrap_or(false)
        };
        if needs_confirmation {
            let answer = self.confirmation.confirm(call).await;
            if let Some(denial) = self.apply_confirmation(call, answer) {
                return denial;
            }
        }

        let timeout_ms = {
            let policy = self.policy.lock().unwrap();
            policy
                .as_ref()
                .map(|p| p.tool_timeout_ms(&call.name, self.config.default_tool_timeout_ms))
                .unwrap_or(self.config.default_tool_timeout_ms)
        };

        let registry = self.registry.clone();
        let name = call.name.clone();
        let args = Value::Object(call.arguments.clone());

        let exec = registry.execute_validated(&name, args);
        tokio::select! {
            biased;
            _ = nexus3_skills::cancel_wait::wait_cancelled(token) => ToolResult::err("cancelled"),
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), exec) => {
                match result {
                    Ok(r) => r,
                    Err(_) => ToolResult::err(format!("Tool '{name}' timed out after {timeout_ms}ms")),
                }
            }
        }
    }

    fn apply_confirmation(&self, call: &ToolCall, answer: ConfirmationResult) -> Option<ToolResult> {
        match answer {
            ConfirmationResult::AllowOnce => None,
            ConfirmationResult::AllowFile => {
                if let Some(path) = call.arguments.get("path").and_then(Value::as_str) {
                    self.widen_allowed_paths(PathBuf::from(path));
                }
                None
            }
            ConfirmationResult::AllowDirectory => {
                if let Some(path) = call.arguments.get("path").and_then(Value::as_str) {
                    let parent = Path::new(path).parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(path));
                    self.widen_allowed_paths(parent);
                }
                None
            }
            ConfirmationResult::AllowExecCwd | ConfirmationResult::AllowExecGlobal => {
                let mut policy = self.policy.lock().unwrap();
                if let Some(p) = policy.as_mut() {
                    p.permissions_mut().tool_overrides.insert(
                        call.name.to_lowercase(),
                        ToolOverride { enabled: Some(true), timeout_ms: None },
                    );
                }
                None
            }
            ConfirmationResult::Deny => Some(ToolResult::err("cancelled by user")),
        }
    }

    fn widen_allowed_paths(&self, path: PathBuf) {
        let mut policy = self.policy.lock().unwrap();
        let Some(p) = policy.as_mut() else { return };
        let perms = p.permissions_mut();
        match &mut perms.allowed_paths {
            Some(paths) => paths.push(path),
            None => perms.allowed_paths = Some(vec![path]),
        }
    }
}

enum TurnResult {
    Message(Message),
    Cancelled,
    EmptyAssistant,
}

fn is_parallel_batch(tool_calls: &[ToolCall]) -> bool {
    !tool_calls.is_empty()
        && tool_calls
            .iter()
            .all(|tc| tc.arguments.get("_parallel").and_then(Value::as_bool).unwrap_or(false))
}

fn stream_event_to_json(event: &nexus3_core::types::StreamEvent) -> Value {
    match event {
        nexus3_core::types::StreamEvent::ContentDelta(d) => serde_json::json!({"content_delta": d}),
        nexus3_core::types::StreamEvent::ReasoningDelta(d) => serde_json::json!({"reasoning_delta": d}),
        nexus3_core::types::StreamEvent::ToolCallStarted { index, id, name } => {
            serde_json::json!({"tool_call_started": {"index": index, "id": id, "name": name}})
        }
        nexus3_core::types::StreamEvent::StreamComplete(m) => {
            serde_json::json!({"stream_complete": {"role": format!("{:?}", m.role)}})
        }
    }
}

fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_batch_requires_every_call_to_opt_in() {
        let mut opted_in = serde_json::Map::new();
        opted_in.insert("_parallel".to_string(), Value::Bool(true));
        let mixed = vec![
            ToolCall { id: "1".into(), name: "a".into(), arguments: opted_in.clone() },
            ToolCall { id: "2".into(), name: "b".into(), arguments: serde_json::Map::new() },
        ];
        assert!(!is_parallel_batch(&mixed));

        let all_in = vec![
            ToolCall { id: "1".into(), name: "a".into(), arguments: opted_in.clone() },
            ToolCall { id: "2".into(), name: "b".into(), arguments: opted_in },
        ];
        assert!(is_parallel_batch(&all_in));
    }

    #[test]
    fn empty_batch_is_not_parallel() {
        assert!(!is_parallel_batch(&[]));
    }

    struct NullProvider;

    #[async_trait::async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn complete_stream(
            &self,
            _request: LlmRequest,
        ) -> nexus3_llm::error::LlmResult<nexus3_llm::provider::LlmStream> {
            use futures::stream;
            Ok(Box::pin(stream::iter(vec![])))
        }
    }

    struct NoopSkill;

    #[async_trait::async_trait]
    impl nexus3_skills::registry::Skill for NoopSkill {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: serde_json::Map<String, Value>) -> ToolResult {
            ToolResult::ok("ran")
        }
    }

    fn session_with_noop_skill() -> Session {
        let mut registry = SkillRegistry::new();
        registry
            .register("noop", Arc::new(|_services: &nexus3_skills::services::ServicesBag| {
                Arc::new(NoopSkill) as Arc<dyn nexus3_skills::registry::Skill>
            }), &nexus3_skills::services::ServicesBag::new())
            .unwrap();

        let context = ContextManager::new(
            nexus3_context::ContextConfig::default(),
            Arc::new(nexus3_context::SimpleTokenCounter),
        );
        let policy = nexus3_core::permission::PermissionPolicy::new(
            nexus3_core::types::AgentPermissions::new(nexus3_core::types::PermissionLevel::Trusted),
        );

        Session::new(
            SessionConfig { agent_id: "test".into(), ..SessionConfig::default() },
            Arc::new(NullProvider),
            Arc::new(registry),
            context,
            policy,
            LogMultiplexer::new(),
        )
    }

    /// I6/H3: a Session with no Permission Policy wired must fail closed —
    /// every tool dispatch synthesizes an error ToolResult rather than
    /// executing, even for an otherwise-harmless registered skill.
    #[tokio::test]
    async fn without_policy_fails_closed_on_tool_dispatch() {
        let session = session_with_noop_skill().without_policy();
        let call = ToolCall { id: "1".into(), name: "noop".into(), arguments: serde_json::Map::new() };
        let token = CancellationToken::new();

        let result = session.execute_one_tool(&call, &token).await;
        assert!(!result.success());
        assert!(result.error.contains("no permission policy wired"));
    }

    /// Control: the same Session, policy still wired, actually runs the skill.
    #[tokio::test]
    async fn with_policy_wired_tool_dispatch_succeeds() {
        let session = session_with_noop_skill();
        let call = ToolCall { id: "1".into(), name: "noop".into(), arguments: serde_json::Map::new() };
        let token = CancellationToken::new();

        let result = session.execute_one_tool(&call, &token).await;
        assert!(result.success());
        assert_eq!(result.output, "ran");
    }
}
