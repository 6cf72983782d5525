//! Skill trait and registry. A factory takes a `ServicesBag` and returns a
//! `Skill`; the registry wraps every registered skill's `execute` with a
//! validator that checks the call's arguments against the skill's declared
//! JSON schema before the skill ever sees them.

use std::collections::HashMap;
use std::sync::Arc;

use nexus3_core::identifiers::{self, ToolNameError};
use nexus3_core::types::ToolResult;
use nexus3_core::validation::{self, ValidationError};
use serde_json::Value;

use crate::services::ServicesBag;

#[async_trait::async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    /// Whether this skill only reads state. Informational only — the
    /// Permission Policy classifies by name, not by this flag.
    fn is_read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult;
}

pub type SkillFactory = Arc<dyn Fn(&ServicesBag) -> Arc<dyn Skill> + Send + Sync>;

#[derive(Default)]
pub struct SkillRegistry {
    factories: HashMap<String, SkillFactory>,
    instances: HashMap<String, Arc<dyn Skill>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid skill name: {0}")]
    InvalidName(#[from] ToolNameError),
    #[error("skill already registered: {0}")]
    AlreadyRegistered(String),
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`. Rejects names that don't pass
    /// `validate_tool_name` (strict — `allow_reserved=false`, since
    /// first-party skill names never need the reserved set).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: SkillFactory,
        services: &ServicesBag,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        identifiers::validate_tool_name(&name, false)?;
        let instance = factory(services);
        self.factories.insert(name.clone(), factory);
        self.instances.insert(name, instance);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some() | self.instances.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.instances.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.instances.keys().map(|s| s.as_str()).collect()
    }

    /// Runs `name`'s execute through the validated wrapper: unknown skill
    /// becomes a ToolResult error (never a panic or an unwrap), and bad
    /// arguments are rejected before the skill's own code sees them.
    pub async fn execute_validated(&self, name: &str, args: Value) -> ToolResult {
        let Some(skill) = self.get(name) else {
            return ToolResult::err(format!("Unknown skill: {name}"));
        };

        let args_map = match args {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return ToolResult::err(format!(
                    "Tool arguments must be a JSON object, got {other}"
                ))
            }
        };

        let schema = skill.parameters();
        let filtered = match validation::validate_tool_arguments(&args_map, &schema, false) {
            Ok(f) => f,
            Err(e) => return ToolResult::err(describe_validation_error(&e)),
        };

        skill.execute(filtered).await
    }
}

fn describe_validation_error(e: &ValidationError) -> String {
    format!("invalid arguments: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoSkill;

    #[async_trait::async_trait]
    impl Skill for EchoSkill {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes the message argument"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            })
        }
        async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
            let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
            ToolResult::ok(format!("Echo: {message}"))
        }
    }

    fn echo_factory() -> SkillFactory {
        Arc::new(|_services| Arc::new(EchoSkill))
    }

    #[tokio::test]
    async fn registers_and_executes_a_skill() {
        let mut registry = SkillRegistry::new();
        let services = ServicesBag::new();
        registry.register("echo", echo_factory(), &services).unwrap();

        let result = registry.execute_validated("echo", json!({"message": "world"})).await;
        assert_eq!(result.to_content(), "Echo: world");
        assert!(result.success());
    }

    #[tokio::test]
    async fn unknown_skill_becomes_tool_result_error() {
        let registry = SkillRegistry::new();
        let result = registry.execute_validated("nope", json!({})).await;
        assert!(!result.success());
        assert!(result.error.contains("Unknown skill"));
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected_before_execute() {
        let mut registry = SkillRegistry::new();
        let services = ServicesBag::new();
        registry.register("echo", echo_factory(), &services).unwrap();

        let result = registry.execute_validated("echo", json!({})).await;
        assert!(!result.success());
        assert!(result.error.contains("missing required field"));
    }

    #[test]
    fn rejects_reserved_skill_names() {
        let mut registry = SkillRegistry::new();
        let services = ServicesBag::new();
        let err = registry.register("system", echo_factory(), &services).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[test]
    fn list_reflects_registered_skills() {
        let mut registry = SkillRegistry::new();
        let services = ServicesBag::new();
        registry.register("echo", echo_factory(), &services).unwrap();
        assert_eq!(registry.list(), vec!["echo"]);
    }
}
