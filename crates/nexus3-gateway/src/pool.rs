//! Agent Pool (C12): `agents: map<agent_id -> Agent>` plus the shared
//! components every agent is built from. Concurrent reads are
//! snapshot-consistent via `DashMap`; mutation (create/destroy) still
//! reasons about the map as a whole (check-then-insert, never two writers
//! racing on the same id).

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use nexus3_context::{ContextConfig, ContextManager, SimpleTokenCounter};
use nexus3_core::permission::PermissionPolicy;
use nexus3_core::types::{AgentPermissions, PermissionLevel, SavedSession};
use nexus3_llm::provider::LlmProvider;
use nexus3_session::{LogMultiplexer, Session, SessionConfig, SessionPersistence, SessionStorage};
use nexus3_skills::registry::SkillRegistry;
use nexus3_skills::services::ServicesBag;

use crate::error::{GatewayError, Result};

pub trait PromptLoader: Send + Sync {
    fn load(&self, agent_id: &str) -> String;
}

pub struct StaticPromptLoader(pub String);

impl PromptLoader for StaticPromptLoader {
    fn load(&self, _agent_id: &str) -> String {
        self.0.clone()
    }
}

/// Builds a fresh `SkillRegistry` for one agent, given the per-agent
/// `ServicesBag` (workspace_root, port, api_key, ...). The binary wires the
/// actual built-in skill set (read/write/edit/bash/grep/glob/sleep, the
/// `nexus_*` pool-control skills) in here; the pool itself stays agnostic of
/// which skills exist.
pub type RegistryBuilder = Arc<dyn Fn(&ServicesBag) -> SkillRegistry + Send + Sync>;

#[derive(Clone)]
pub struct AgentPoolConfig {
    pub provider: Arc<dyn LlmProvider>,
    pub base_log_dir: PathBuf,
    pub log_mux: LogMultiplexer,
    pub registry_builder: RegistryBuilder,
    pub services: ServicesBag,
    pub prompt_loader: Arc<dyn PromptLoader>,
    pub default_permission_level: PermissionLevel,
    pub model: String,
    pub max_tokens: u32,
    pub default_tool_timeout_ms: u64,
    pub context_config: ContextConfig,
    pub persistence: Option<Arc<SessionPersistence>>,
}

pub struct AgentHandle {
    pub session: Arc<Session>,
    pub storage: Arc<SessionStorage>,
    pub created_at: f64,
    pub is_temp: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub is_temp: bool,
    pub created_at: f64,
    pub message_count: usize,
    pub should_shutdown: bool,
}

pub struct AgentPool {
    config: AgentPoolConfig,
    agents: DashMap<String, Arc<AgentHandle>>,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self { config, agents: DashMap::new() }
    }

    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn new_registry(&self) -> Arc<SkillRegistry> {
        Arc::new((self.config.registry_builder)(&self.config.services))
    }

    fn new_policy(&self, disabled_tools: &[String]) -> PermissionPolicy {
        self.new_policy_at_level(self.config.default_permission_level, disabled_tools)
    }

    fn new_policy_at_level(&self, level: PermissionLevel, disabled_tools: &[String]) -> PermissionPolicy {
        let mut permissions = AgentPermissions::new(level);
        for tool in disabled_tools {
            permissions.tool_overrides.insert(
                tool.to_lowercase(),
                nexus3_core::types::ToolOverride { enabled: Some(false), timeout_ms: None },
            );
        }
        PermissionPolicy::new(permissions)
    }

    async fn build_storage(&self, agent_id: &str) -> Result<Arc<SessionStorage>> {
        Ok(Arc::new(SessionStorage::open(&self.config.base_log_dir, agent_id).await?))
    }

    /// Opens and registers this agent's `raw.jsonl` sink with the Log
    /// Multiplexer, and opens its `context.md` writer, both under
    /// `{base_log_dir}/{agent_id}/` alongside `session.db` (§4.7/§4.8).
    /// Registering the raw sink here — rather than leaving it to whoever
    /// calls `Session::send` — is what makes `agent_context` scoping in
    /// `session.rs` actually land entries in a file instead of silently
    /// dropping them.
    fn open_log_sinks(
        &self,
        agent_id: &str,
    ) -> Result<(Arc<nexus3_session::RawWriter>, nexus3_session::MarkdownWriter)> {
        let dir = self.config.base_log_dir.join(agent_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| GatewayError::Internal(format!("failed to create log dir for {agent_id}: {e}")))?;

        let raw = nexus3_session::RawWriter::open(dir.join("raw.jsonl")).map_err(GatewayError::Session)?;
        let markdown = nexus3_session::MarkdownWriter::open(dir.join("context.md")).map_err(GatewayError::Session)?;
        Ok((Arc::new(raw), markdown))
    }

    /// Validates the id, rejects duplicates, builds Context/registry/
    /// permissions/Session, registers the session's raw-log sink with the
    /// multiplexer, and stores the agent in the map.
    pub async fn create(&self, agent_id: &str) -> Result<Arc<AgentHandle>> {
        nexus3_core::identifiers::validate_agent_id(agent_id)
            .map_err(|e| GatewayError::InvalidAgentId(e.to_string()))?;
        if self.agents.contains_key(agent_id) {
            return Err(GatewayError::AgentAlreadyExists(agent_id.to_string()));
        }

        let storage = self.build_storage(agent_id).await?;
        storage.init_markers(nexus3_core::types::SessionType::Saved, None, self.now()).await?;

        let mut context = ContextManager::new(self.config.context_config.clone(), Arc::new(SimpleTokenCounter));
        context.set_system_prompt(self.config.prompt_loader.load(agent_id));

        let policy = self.new_policy(&[]);
        let registry = self.new_registry();
        let (raw_sink, markdown) = self.open_log_sinks(agent_id)?;
        self.config.log_mux.register(agent_id, raw_sink);

        let session_config = SessionConfig {
            agent_id: agent_id.to_string(),
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: None,
            default_tool_timeout_ms: self.config.default_tool_timeout_ms,
            max_tool_iterations: nexus3_session::MAX_TOOL_ITERATIONS,
        };

        let session = Arc::new(
            Session::new(
                session_config,
                self.config.provider.clone(),
                registry,
                context,
                policy,
                self.config.log_mux.clone(),
            )
            .with_markdown_writer(markdown)
            .with_storage(storage.clone()),
        );

        let handle = Arc::new(AgentHandle { session, storage, created_at: self.now(), is_temp: is_temp_id(agent_id) });
        self.agents.insert(agent_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Returns the agent if active. If not, and auto-restore is wired
    /// (persistence present and a saved session exists), the HTTP layer can
    /// call `restore_from_saved` before reporting "not found" — this method
    /// itself does not auto-restore, since "already active" must win over a
    /// stale saved copy.
    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.get(agent_id).map(|r| r.clone())
    }

    pub fn log_mux(&self) -> LogMultiplexer {
        self.config.log_mux.clone()
    }

    pub fn session_exists(&self, agent_id: &str) -> bool {
        self.config.persistence.as_ref().map(|p| p.session_exists(agent_id)).unwrap_or(false)
    }

    /// Builds an Agent from a `SavedSession`: preserves `created_at`,
    /// installs the saved permission preset and disabled-tool list, replays
    /// message history into Context, and registers skills. Rejects if
    /// `agent_id` is already present (an active agent always wins).
    pub async fn restore_from_saved(&self, saved: SavedSession) -> Result<Arc<AgentHandle>> {
        if self.agents.contains_key(&saved.agent_id) {
            return Err(GatewayError::AgentAlreadyExists(saved.agent_id.clone()));
        }

        let storage = self.build_storage(&saved.agent_id).await?;
        storage.init_markers(nexus3_core::types::SessionType::Saved, None, saved.created_at).await?;

        let mut context = ContextManager::new(self.config.context_config.clone(), Arc::new(SimpleTokenCounter));
        context.set_system_prompt(saved.system_prompt.clone());
        for message in &saved.messages {
            match message.role {
                nexus3_core::types::Role::User => context.add_user_message(message.content.clone()),
                nexus3_core::types::Role::Assistant => context.add_assistant_message(message.clone()),
                nexus3_core::types::Role::Tool => {
                    let result = nexus3_core::types::ToolResult::ok(message.content.clone());
                    context.add_tool_result(
                        message.tool_call_id.clone().unwrap_or_default(),
                        "restored",
                        &result,
                    );
                }
                nexus3_core::types::Role::System => {}
            }
        }

        // §4.12: restore the agent's own permission preset rather than the
        // pool default — resolve from `permission_preset` (handles the
        // `worker` alias) and fall back to the saved raw `permission_level`.
        let restored_level = saved
            .permission_preset
            .as_deref()
            .and_then(PermissionLevel::from_preset_name)
            .unwrap_or(saved.permission_level);
        let policy = self.new_policy_at_level(restored_level, &saved.disabled_tools);
        let registry = self.new_registry();
        let (raw_sink, markdown) = self.open_log_sinks(&saved.agent_id)?;
        self.config.log_mux.register(saved.agent_id.clone(), raw_sink);

        let session_config = SessionConfig {
            agent_id: saved.agent_id.clone(),
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: None,
            default_tool_timeout_ms: self.config.default_tool_timeout_ms,
            max_tool_iterations: nexus3_session::MAX_TOOL_ITERATIONS,
        };

        let session = Arc::new(
            Session::new(
                session_config,
                self.config.provider.clone(),
                registry,
                context,
                policy,
                self.config.log_mux.clone(),
            )
            .with_markdown_writer(markdown)
            .with_storage(storage.clone()),
        );

        let handle = Arc::new(AgentHandle {
            session,
            storage,
            created_at: saved.created_at,
            is_temp: is_temp_id(&saved.agent_id),
        });
        self.agents.insert(saved.agent_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Cancels any in-flight work, unregisters the log sink, marks storage
    /// destroyed, and removes the agent from the map.
    pub async fn destroy(&self, agent_id: &str) -> Result<()> {
        let Some((_, handle)) = self.agents.remove(agent_id) else {
            return Err(GatewayError::AgentNotFound(agent_id.to_string()));
        };
        handle.session.cancel();
        self.config.log_mux.unregister(agent_id);
        handle.storage.update_markers_status(nexus3_core::types::SessionStatus::Destroyed, self.now()).await?;
        Ok(())
    }

    pub fn list(&self) -> Vec<AgentSummary> {
        self.agents
            .iter()
            .map(|entry| {
                let handle = entry.value();
                let message_count = handle.session.context_snapshot().len();
                AgentSummary {
                    agent_id: entry.key().clone(),
                    is_temp: handle.is_temp,
                    created_at: handle.created_at,
                    message_count,
                    should_shutdown: false,
                }
            })
            .collect()
    }
}

fn is_temp_id(agent_id: &str) -> bool {
    nexus3_core::identifiers::is_temp_agent_id(agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test-only in-memory provider that never streams real content; enough
    // to exercise pool create/destroy/list without a network dependency.
    struct NullProvider;

    #[async_trait::async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn complete_stream(
            &self,
            _request: nexus3_llm::provider::LlmRequest,
        ) -> nexus3_llm::error::LlmResult<nexus3_llm::provider::LlmStream> {
            use futures::stream;
            let events = vec![Ok(nexus3_core::types::StreamEvent::StreamComplete(
                nexus3_core::types::Message::assistant("done", vec![]),
            ))];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    fn test_config(base_dir: &std::path::Path) -> AgentPoolConfig {
        AgentPoolConfig {
            provider: Arc::new(NullProvider),
            base_log_dir: base_dir.to_path_buf(),
            log_mux: LogMultiplexer::new(),
            registry_builder: Arc::new(|_services: &ServicesBag| SkillRegistry::new()),
            services: ServicesBag::new(),
            prompt_loader: Arc::new(StaticPromptLoader("you are helpful".to_string())),
            default_permission_level: PermissionLevel::Trusted,
            model: "test-model".to_string(),
            max_tokens: 1024,
            default_tool_timeout_ms: 5_000,
            context_config: ContextConfig::default(),
            persistence: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_then_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(test_config(dir.path()));

        pool.create("alice").await.unwrap();
        assert!(pool.get("alice").is_some());

        pool.destroy("alice").await.unwrap();
        assert!(pool.get("alice").is_none());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(test_config(dir.path()));

        pool.create("alice").await.unwrap();
        let err = pool.create("alice").await.unwrap_err();
        assert!(matches!(err, GatewayError::AgentAlreadyExists(_)));
    }

    fn saved_session(agent_id: &str, permission_preset: Option<&str>) -> SavedSession {
        SavedSession {
            schema_version: nexus3_core::types::SAVED_SESSION_SCHEMA_VERSION,
            agent_id: agent_id.to_string(),
            created_at: 0.0,
            modified_at: 0.0,
            messages: vec![],
            system_prompt: "be helpful".to_string(),
            system_prompt_path: None,
            working_directory: "/workspace".to_string(),
            permission_level: PermissionLevel::Trusted,
            permission_preset: permission_preset.map(str::to_string),
            disabled_tools: vec![],
            token_usage: None,
            provenance: "user".to_string(),
        }
    }

    /// §4.12: a saved Sandboxed agent must restore as Sandboxed even though
    /// the pool default is Trusted.
    #[tokio::test]
    async fn restore_from_saved_installs_saved_permission_preset_not_pool_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.default_permission_level = PermissionLevel::Trusted;
        let pool = AgentPool::new(config);

        let saved = saved_session("restored-agent", Some("sandboxed"));
        let handle = pool.restore_from_saved(saved).await.unwrap();
        assert_eq!(handle.session.permission_level(), PermissionLevel::Sandboxed);
    }

    /// The `worker` alias must also resolve to Sandboxed on restore.
    #[tokio::test]
    async fn restore_from_saved_resolves_worker_alias_preset() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(test_config(dir.path()));

        let saved = saved_session("worker-agent", Some("worker"));
        let handle = pool.restore_from_saved(saved).await.unwrap();
        assert_eq!(handle.session.permission_level(), PermissionLevel::Sandboxed);
    }

    /// No preset string on the saved session: fall back to the saved raw
    /// `permission_level` rather than the pool default.
    #[tokio::test]
    async fn restore_from_saved_falls_back_to_raw_permission_level_without_preset() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.default_permission_level = PermissionLevel::Trusted;
        let pool = AgentPool::new(config);

        let mut saved = saved_session("no-preset-agent", None);
        saved.permission_level = PermissionLevel::Sandboxed;
        let handle = pool.restore_from_saved(saved).await.unwrap();
        assert_eq!(handle.session.permission_level(), PermissionLevel::Sandboxed);
    }

    #[tokio::test]
    async fn temp_ids_are_flagged_in_list() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(test_config(dir.path()));

        pool.create(".1").await.unwrap();
        let listed = pool.list();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_temp);
    }
}
