//! `nexus_*` pool-control skills: let one agent drive another through the
//! gateway's HTTP/JSON-RPC surface. Every outbound URL goes through the
//! SSRF guard before the request is made, and a missing/invalid port or
//! agent id fails before any network I/O happens.
//!
//! The two-level iteration boundary from the data model: the Session loop
//! (C10) halts at 10 tool iterations per `send` call; `nexus_send` may
//! re-invoke `send` (with empty content, to resume the same turn) up to
//! `MAX_SEND_REINVOCATIONS` times while the agent keeps reporting
//! `halted_at_iteration_limit`, so the two caps stay distinct rather than
//! collapsing into one.

use std::sync::Arc;

use nexus3_core::identifiers::validate_agent_id;
use nexus3_core::types::ToolResult;
use nexus3_core::url_validator::validate_url;
use reqwest::Client;
use serde_json::{json, Value};

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

const DEFAULT_PORT: u16 = 8765;
/// Bounds `nexus_send`'s own re-invoke loop. Distinct from, and larger
/// than, the Session loop's internal cap of 10 tool iterations per call.
const MAX_SEND_REINVOCATIONS: u32 = 100;

#[derive(Clone)]
struct NexusPoolClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum PoolClientError {
    #[error("{0}")]
    Security(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("server returned an error: {0}")]
    Rpc(String),
}

impl NexusPoolClient {
    fn new(port: u16, api_key: Option<String>, allow_localhost: bool) -> Result<Self, PoolClientError> {
        let base_url = format!("http://127.0.0.1:{port}");
        validate_url(&format!("{base_url}/"), allow_localhost)
            .map_err(|e| PoolClientError::Security(e.to_string()))?;
        Ok(Self { client: Client::new(), base_url, api_key })
    }

    async fn call(&self, path: &str, method: &str, params: Value) -> Result<Value, PoolClientError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": method,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(format!("{}{}", self.base_url, path)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| PoolClientError::Request(e.to_string()))?;
        let envelope: Value =
            response.json().await.map_err(|e| PoolClientError::Request(e.to_string()))?;

        if let Some(error) = envelope.get("error") {
            return Err(PoolClientError::Rpc(error.to_string()));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn resolve_port(args: &serde_json::Map<String, Value>, services: &ServicesBag) -> u16 {
    if let Some(p) = args.get("port").and_then(Value::as_u64) {
        return p as u16;
    }
    services.get_u16("port").unwrap_or(DEFAULT_PORT)
}

fn resolve_api_key(services: &ServicesBag) -> Option<String> {
    services.get_string("api_key")
}

fn security_error(e: impl std::fmt::Display) -> ToolResult {
    ToolResult::err(format!("URL validation failed: {e}"))
}

// ---------------------------------------------------------------------------
// nexus_send
// ---------------------------------------------------------------------------

pub struct NexusSendSkill {
    services: ServicesBag,
}

impl NexusSendSkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            Arc::new(NexusSendSkill { services: services.clone() }) as Arc<dyn Skill>
        })
    }
}

#[async_trait::async_trait]
impl Skill for NexusSendSkill {
    fn name(&self) -> &str {
        "nexus_send"
    }

    fn description(&self) -> &str {
        "Send a message to a Nexus agent and get the response. The agent may use tools \
         before responding; if it halts at the internal iteration cap, this skill resumes \
         it automatically up to 100 times before returning a warning."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {"type": "string", "description": "ID of the agent to send to (e.g. 'worker-1')"},
                "content": {"type": "string", "description": "Message to send"},
                "port": {"type": "integer", "description": "Server port (default: 8765)"}
            },
            "required": ["agent_id", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(agent_id) = args.get("agent_id").and_then(Value::as_str) else {
            return ToolResult::err("No agent_id provided");
        };
        if let Err(e) = validate_agent_id(agent_id) {
            return ToolResult::err(format!("Invalid agent_id: {e}"));
        }
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolResult::err("No content provided");
        };

        let port = resolve_port(&args, &self.services);
        let client = match NexusPoolClient::new(port, resolve_api_key(&self.services), true) {
            Ok(c) => c,
            Err(e) => return security_error(e),
        };

        let path = format!("/agent/{agent_id}");
        let mut next_content = content.to_string();
        let mut last_result = json!({});

        for attempt in 0..MAX_SEND_REINVOCATIONS {
            let params = json!({"content": next_content});
            match client.call(&path, "send", params).await {
                Ok(result) => {
                    let halted = result.get("halted_at_iteration_limit").and_then(Value::as_bool).unwrap_or(false);
                    last_result = result;
                    if !halted {
                        return ToolResult::ok(last_result.to_string());
                    }
                    // Resume the same turn with empty content; the agent's
                    // Session retains its own in-progress tool-call state.
                    next_content = String::new();
                    let _ = attempt;
                }
                Err(e) => return ToolResult::err(e.to_string()),
            }
        }

        let warning = format!(
            "\n\n[WARNING: Agent '{agent_id}' halted at max tool iterations after {MAX_SEND_REINVOCATIONS} \
             re-invocations. Send another message to continue, or use nexus_status to check state.]"
        );
        let content_so_far = last_result.get("content").and_then(Value::as_str).unwrap_or_default();
        let mut data = last_result;
        if let Value::Object(ref mut map) = data {
            map.insert("content".to_string(), json!(format!("{content_so_far}{warning}")));
        }
        ToolResult::ok(data.to_string())
    }
}

// ---------------------------------------------------------------------------
// nexus_cancel
// ---------------------------------------------------------------------------

pub struct NexusCancelSkill {
    services: ServicesBag,
}

impl NexusCancelSkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            Arc::new(NexusCancelSkill { services: services.clone() }) as Arc<dyn Skill>
        })
    }
}

#[async_trait::async_trait]
impl Skill for NexusCancelSkill {
    fn name(&self) -> &str {
        "nexus_cancel"
    }

    fn description(&self) -> &str {
        "Cancel an in-progress request on a Nexus agent"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {"type": "string", "description": "ID of the agent to cancel on"},
                "request_id": {"type": "string", "description": "Request ID to cancel"},
                "port": {"type": "integer", "description": "Server port (default: 8765)"}
            },
            "required": ["agent_id", "request_id"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(agent_id) = args.get("agent_id").and_then(Value::as_str) else {
            return ToolResult::err("No agent_id provided");
        };
        if let Err(e) = validate_agent_id(agent_id) {
            return ToolResult::err(format!("Invalid agent_id: {e}"));
        }
        let Some(request_id) = args.get("request_id").and_then(Value::as_str) else {
            return ToolResult::err("No request_id provided");
        };

        let port = resolve_port(&args, &self.services);
        let client = match NexusPoolClient::new(port, resolve_api_key(&self.services), true) {
            Ok(c) => c,
            Err(e) => return security_error(e),
        };

        let path = format!("/agent/{agent_id}");
        match client.call(&path, "cancel", json!({"request_id": request_id})).await {
            Ok(result) => ToolResult::ok(result.to_string()),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// nexus_destroy
// ---------------------------------------------------------------------------

pub struct NexusDestroySkill {
    services: ServicesBag,
}

impl NexusDestroySkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            Arc::new(NexusDestroySkill { services: services.clone() }) as Arc<dyn Skill>
        })
    }
}

#[async_trait::async_trait]
impl Skill for NexusDestroySkill {
    fn name(&self) -> &str {
        "nexus_destroy"
    }

    fn description(&self) -> &str {
        "Destroy an agent on the Nexus server (the server itself keeps running)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {"type": "string", "description": "ID of the agent to destroy"},
                "port": {"type": "integer", "description": "Server port (default: 8765)"}
            },
            "required": ["agent_id"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(agent_id) = args.get("agent_id").and_then(Value::as_str) else {
            return ToolResult::err("No agent_id provided");
        };
        if let Err(e) = validate_agent_id(agent_id) {
            return ToolResult::err(format!("Invalid agent_id: {e}"));
        }

        let port = resolve_port(&args, &self.services);
        let client = match NexusPoolClient::new(port, resolve_api_key(&self.services), true) {
            Ok(c) => c,
            Err(e) => return security_error(e),
        };

        match client.call("/", "destroy_agent", json!({"agent_id": agent_id})).await {
            Ok(result) => ToolResult::ok(result.to_string()),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// nexus_shutdown
// ---------------------------------------------------------------------------

pub struct NexusShutdownSkill {
    services: ServicesBag,
}

impl NexusShutdownSkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            Arc::new(NexusShutdownSkill { services: services.clone() }) as Arc<dyn Skill>
        })
    }
}

#[async_trait::async_trait]
impl Skill for NexusShutdownSkill {
    fn name(&self) -> &str {
        "nexus_shutdown"
    }

    fn description(&self) -> &str {
        "Request graceful shutdown of the Nexus server (stops all agents)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "port": {"type": "integer", "description": "Server port (default: 8765)"}
            },
            "required": []
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let port = resolve_port(&args, &self.services);
        let client = match NexusPoolClient::new(port, resolve_api_key(&self.services), true) {
            Ok(c) => c,
            Err(e) => return security_error(e),
        };

        match client.call("/", "shutdown_server", json!({})).await {
            Ok(result) => ToolResult::ok(result.to_string()),
            Err(e) => ToolResult::err(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// nexus_status
// ---------------------------------------------------------------------------

pub struct NexusStatusSkill {
    services: ServicesBag,
}

impl NexusStatusSkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            Arc::new(NexusStatusSkill { services: services.clone() }) as Arc<dyn Skill>
        })
    }
}

#[async_trait::async_trait]
impl Skill for NexusStatusSkill {
    fn name(&self) -> &str {
        "nexus_status"
    }

    fn description(&self) -> &str {
        "Get status of a Nexus agent (token usage and context info)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": {"type": "string", "description": "ID of the agent"},
                "port": {"type": "integer", "description": "Server port (default: 8765)"}
            },
            "required": ["agent_id"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(agent_id) = args.get("agent_id").and_then(Value::as_str) else {
            return ToolResult::err("No agent_id provided");
        };
        if let Err(e) = validate_agent_id(agent_id) {
            return ToolResult::err(format!("Invalid agent_id: {e}"));
        }

        let port = resolve_port(&args, &self.services);
        let client = match NexusPoolClient::new(port, resolve_api_key(&self.services), true) {
            Ok(c) => c,
            Err(e) => return security_error(e),
        };

        let path = format!("/agent/{agent_id}");
        let tokens = match client.call(&path, "get_tokens", json!({})).await {
            Ok(v) => v,
            Err(e) => return ToolResult::err(e.to_string()),
        };
        let context = match client.call(&path, "get_context", json!({})).await {
            Ok(v) => v,
            Err(e) => return ToolResult::err(e.to_string()),
        };

        let combined = json!({"tokens": tokens, "context": context});
        ToolResult::ok(serde_json::to_string_pretty(&combined).unwrap_or_else(|_| combined.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unresolvable_agent_id_before_any_network_call() {
        assert!(validate_agent_id("../escape").is_err());
    }

    #[tokio::test]
    async fn nexus_send_rejects_missing_agent_id() {
        let skill = NexusSendSkill { services: ServicesBag::new() };
        let mut args = serde_json::Map::new();
        args.insert("content".into(), json!("hi"));
        let result = skill.execute(args).await;
        assert!(!result.success());
        assert!(result.error.contains("agent_id"));
    }

    #[tokio::test]
    async fn nexus_cancel_rejects_missing_request_id() {
        let skill = NexusCancelSkill { services: ServicesBag::new() };
        let mut args = serde_json::Map::new();
        args.insert("agent_id".into(), json!("worker-1"));
        let result = skill.execute(args).await;
        assert!(!result.success());
        assert!(result.error.contains("request_id"));
    }

    #[tokio::test]
    async fn nexus_destroy_rejects_invalid_agent_id() {
        let skill = NexusDestroySkill { services: ServicesBag::new() };
        let mut args = serde_json::Map::new();
        args.insert("agent_id".into(), json!("../etc"));
        let result = skill.execute(args).await;
        assert!(!result.success());
        assert!(result.error.contains("Invalid agent_id"));
    }

    #[test]
    fn resolve_port_prefers_explicit_arg_over_services() {
        let mut services = ServicesBag::new();
        services.insert("port", 9999u16);
        let mut args = serde_json::Map::new();
        args.insert("port".into(), json!(1234));
        assert_eq!(resolve_port(&args, &services), 1234);
    }

    #[test]
    fn resolve_port_falls_back_to_default() {
        let services = ServicesBag::new();
        let args = serde_json::Map::new();
        assert_eq!(resolve_port(&args, &services), DEFAULT_PORT);
    }
}
