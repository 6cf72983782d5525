//! RPC Dispatcher (C13): two JSON-RPC 2.0 dispatcher flavors sharing the
//! same framing — a `GlobalDispatcher` for pool-wide administration, and a
//! per-agent `Dispatcher` bound to one `AgentHandle`. Every handler that
//! causes provider I/O runs inside `multiplexer.agent_context(agent_id)` so
//! raw-log events land in the right session's `raw.jsonl`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::pool::{AgentHandle, AgentPool};

pub type RpcResult = Result<Value, (i64, String)>;

fn from_gateway_error(e: GatewayError) -> (i64, String) {
    let code = e.rpc_code();
    (code, e.to_string())
}

fn missing_param(name: &str) -> (i64, String) {
    (-32602, format!("Missing required param: {name}"))
}

/// Builds a standard JSON-RPC 2.0 response object (either `result` or
/// `error`, mirroring `id` back verbatim).
pub fn to_response(id: Value, result: RpcResult) -> Value {
    match result {
        Ok(value) => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": value}),
        Err((code, message)) => {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    }
}

/// Handles `create_agent`/`destroy_agent`/`list_agents`/`shutdown_server`
/// against the shared pool.
pub struct GlobalDispatcher {
    pool: Arc<AgentPool>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl GlobalDispatcher {
    pub fn new(pool: Arc<AgentPool>, shutdown: tokio::sync::watch::Sender<bool>) -> Self {
        Self { pool, shutdown }
    }

    pub async fn dispatch(&self, method: &str, params: &Value) -> RpcResult {
        match method {
            "create_agent" => self.create_agent(params).await,
            "destroy_agent" => self.destroy_agent(params).await,
            "list_agents" => self.list_agents().await,
            "shutdown_server" => self.shutdown_server().await,
            other => Err((-32601, format!("Method not found: {other}"))),
        }
    }

    async fn create_agent(&self, params: &Value) -> RpcResult {
        let name = params.get("name").and_then(Value::as_str).ok_or_else(|| missing_param("name"))?;
        let handle = self.pool.create(name).await.map_err(from_gateway_error)?;
        Ok(serde_json::json!({"agent_id": name, "created_at": handle.created_at}))
    }

    async fn destroy_agent(&self, params: &Value) -> RpcResult {
        let agent_id = params.get("agent_id").and_then(Value::as_str).ok_or_else(|| missing_param("agent_id"))?;
        self.pool.destroy(agent_id).await.map_err(from_gateway_error)?;
        Ok(serde_json::json!({"ok": true}))
    }

    async fn list_agents(&self) -> RpcResult {
        let agents = self.pool.list();
        Ok(serde_json::json!({"agents": agents}))
    }

    async fn shutdown_server(&self) -> RpcResult {
        let _ = self.shutdown.send(true);
        Ok(serde_json::json!({"ok": true, "shutting_down": true}))
    }
}

/// Handles `send`/`cancel`/`get_context`/`get_tokens`/`get_messages` plus
/// save/clone/rename against one agent. Request ids are tracked in an
/// in-flight set so `cancel(request_id)` only affects a request that is
/// actually still running on this agent.
pub struct Dispatcher {
    handle: Arc<AgentHandle>,
    persistence: Option<Arc<nexus3_session::SessionPersistence>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(handle: Arc<AgentHandle>, persistence: Option<Arc<nexus3_session::SessionPersistence>>) -> Self {
        Self { handle, persistence, in_flight: Mutex::new(HashSet::new()) }
    }

    pub async fn dispatch(&self, method: &str, params: &Value) -> RpcResult {
        match method {
            "send" => self.send(params).await,
            "cancel" => self.cancel(params).await,
            "get_context" => self.get_context().await,
            "get_tokens" => self.get_tokens().await,
            "get_messages" => self.get_messages().await,
            "save" => self.save().await,
            "clone" => self.clone_session(params).await,
            "rename" => self.rename_session(params).await,
            other => Err((-32601, format!("Method not found: {other}"))),
        }
    }

    /// Drains `session.send(content)` to completion and reports the
    /// collected text plus whether the internal iteration cap was hit —
    /// `nexus_send` uses `halted_at_iteration_limit` to decide whether to
    /// re-invoke with empty content.
    async fn send(&self, params: &Value) -> RpcResult {
        let content = params.get("content").and_then(Value::as_str).ok_or_else(|| missing_param("content"))?;
        let request_id = params
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.in_flight.lock().unwrap().insert(request_id.clone());
        let _guard = InFlightGuard { set: &self.in_flight, id: request_id.clone() };

        let mut stream = self.handle.session.send(content.to_string());
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk);
        }

        Ok(serde_json::json!({
            "content": collected,
            "halted_at_iteration_limit": self.handle.session.halted_at_iteration_limit(),
            "request_id": request_id,
        }))
    }

    async fn cancel(&self, params: &Value) -> RpcResult {
        let request_id = params.get("request_id").and_then(Value::as_str);
        match request_id {
            Some(id) => {
                let still_running = self.in_flight.lock().unwrap().contains(id);
                if !still_running {
                    return Ok(serde_json::json!({"ok": false, "reason": "request already completed"}));
                }
            }
            None => {}
        }
        self.handle.session.cancel();
        Ok(serde_json::json!({"ok": true}))
    }

    async fn get_context(&self) -> RpcResult {
        let messages = self.handle.session.context_snapshot();
        Ok(serde_json::json!({"messages": messages}))
    }

    async fn get_tokens(&self) -> RpcResult {
        let usage = self.handle.session.token_usage();
        Ok(serde_json::json!({
            "system": usage.system,
            "tools": usage.tools,
            "messages": usage.messages,
            "total": usage.total,
            "budget": usage.budget,
            "available": usage.available,
        }))
    }

    async fn get_messages(&self) -> RpcResult {
        let messages = self.handle.session.context_snapshot();
        Ok(serde_json::json!({"messages": messages}))
    }

    fn persistence(&self) -> Result<&Arc<nexus3_session::SessionPersistence>, (i64, String)> {
        self.persistence
            .as_ref()
            .ok_or_else(|| (-32603, "session persistence is not configured on this server".to_string()))
    }

    async fn save(&self) -> RpcResult {
        let persistence = self.persistence()?;
        let saved = self.to_saved_session();
        persistence.save(&saved.agent_id, &saved).await.map_err(|e| from_gateway_error(GatewayError::from(e)))?;
        Ok(serde_json::json!({"ok": true}))
    }

    async fn clone_session(&self, params: &Value) -> RpcResult {
        let dest = params.get("dest").and_then(Value::as_str).ok_or_else(|| missing_param("dest"))?;
        let persistence = self.persistence()?;
        self.save().await?;
        persistence
            .clone_session(self.handle.session.agent_id(), dest)
            .await
            .map_err(|e| from_gateway_error(GatewayError::from(e)))?;
        Ok(serde_json::json!({"ok": true, "dest": dest}))
    }

    async fn rename_session(&self, params: &Value) -> RpcResult {
        let dest = params.get("dest").and_then(Value::as_str).ok_or_else(|| missing_param("dest"))?;
        let persistence = self.persistence()?;
        self.save().await?;
        persistence
            .rename_session(self.handle.session.agent_id(), dest)
            .await
            .map_err(|e| from_gateway_error(GatewayError::from(e)))?;
        Ok(serde_json::json!({"ok": true, "dest": dest}))
    }

    fn to_saved_session(&self) -> nexus3_core::types::SavedSession {
        nexus3_core::types::SavedSession {
            schema_version: nexus3_core::types::SAVED_SESSION_SCHEMA_VERSION,
            agent_id: self.handle.session.agent_id().to_string(),
            created_at: self.handle.created_at,
            modified_at: self.handle.created_at,
            messages: self.handle.session.context_snapshot(),
            system_prompt: self.handle.session.system_prompt(),
            system_prompt_path: None,
            working_directory: std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
            permission_level: self.handle.session.permission_level(),
            permission_preset: None,
            disabled_tools: self.handle.session.disabled_tools(),
            token_usage: Some(self.handle.session.token_usage().total as u64),
            provenance: "user".to_string(),
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_response_wraps_ok_result() {
        let response = to_response(Value::from(1), Ok(serde_json::json!({"a": 1})));
        assert_eq!(response["result"]["a"], 1);
        assert!(response.get("error").is_none());
    }

    #[test]
    fn to_response_wraps_error_result() {
        let response = to_response(Value::from(1), Err((-32601, "nope".to_string())));
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["message"], "nope");
    }
}
