//! Sleep skill — sleeps for a bounded duration. Exists to exercise
//! parallel-execution and timeout behavior in tests, not a production tool.

use std::sync::Arc;

use nexus3_core::types::ToolResult;
use serde_json::{json, Value};

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

const MAX_SLEEP_SECONDS: f64 = 3600.0;

pub struct SleepSkill;

impl SleepSkill {
    pub fn factory() -> SkillFactory {
        Arc::new(|_services: &ServicesBag| Arc::new(SleepSkill) as Arc<dyn Skill>)
    }
}

#[async_trait::async_trait]
impl Skill for SleepSkill {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for a specified number of seconds (for testing)"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "seconds": {"type": "number", "description": "Number of seconds to sleep (max 3600)"},
                "label": {"type": "string", "description": "Optional label to identify this sleep in output"}
            },
            "required": ["seconds"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let seconds = args.get("seconds").and_then(Value::as_f64).unwrap_or(1.0);
        if seconds < 0.0 {
            return ToolResult::err("Sleep duration must be non-negative");
        }
        if seconds > MAX_SLEEP_SECONDS {
            return ToolResult::err(format!("Sleep duration {seconds}s exceeds maximum ({MAX_SLEEP_SECONDS}s)"));
        }

        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;

        match args.get("label").and_then(Value::as_str) {
            Some(label) if !label.is_empty() => ToolResult::ok(format!("Slept {seconds}s ({label})")),
            _ => ToolResult::ok(format!("Slept {seconds}s")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleeps_and_reports_duration() {
        let skill = SleepSkill;
        let mut args = serde_json::Map::new();
        args.insert("seconds".into(), json!(0.01));
        let result = skill.execute(args).await;
        assert!(result.output.contains("0.01"));
    }

    #[tokio::test]
    async fn rejects_excessive_duration() {
        let skill = SleepSkill;
        let mut args = serde_json::Map::new();
        args.insert("seconds".into(), json!(999_999));
        let result = skill.execute(args).await;
        assert!(!result.success());
    }

    #[tokio::test]
    async fn rejects_negative_duration() {
        let skill = SleepSkill;
        let mut args = serde_json::Map::new();
        args.insert("seconds".into(), json!(-1));
        let result = skill.execute(args).await;
        assert!(!result.success());
    }
}
