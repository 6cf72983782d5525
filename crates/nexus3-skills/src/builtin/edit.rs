//! Edit skill — find-and-replace an exact string match in a file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nexus3_core::types::ToolResult;
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

pub struct EditSkill {
    workspace_root: PathBuf,
}

impl EditSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            Arc::new(EditSkill::new(root)) as Arc<dyn Skill>
        })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        }
    }
}

#[async_trait::async_trait]
impl Skill for EditSkill {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string match. The old_string must appear \
         exactly once in the file. Use replace_all to replace all occurrences."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path to the file to edit"},
                "old_string": {"type": "string", "description": "Exact text to find and replace"},
                "new_string": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace all occurrences (default: false)"}
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(path) = args.get("file_path").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: file_path");
        };
        let Some(old) = args.get("old_string").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: old_string");
        };
        let Some(new) = args.get("new_string").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: new_string");
        };
        let replace_all = args.get("replace_all").and_then(Value::as_bool).unwrap_or(false);

        let full_path = self.resolve(path);
        let content = match fs::read_to_string(&full_path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("Failed to read file: {e}")),
        };

        if !content.contains(old) {
            return ToolResult::err("old_string not found in file");
        }

        let new_content = if replace_all {
            content.replace(old, new)
        } else {
            let count = content.matches(old).count();
            if count > 1 {
                return ToolResult::err(format!(
                    "old_string found {count} times — must be unique. Use replace_all or provide more context."
                ));
            }
            content.replacen(old, new, 1)
        };

        match fs::write(&full_path, &new_content).await {
            Ok(()) => {
                debug!(path, "edit");
                ToolResult::ok(format!("Edited {path}"))
            }
            Err(e) => ToolResult::err(format!("Failed to write: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let skill = EditSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), json!("a.txt"));
        args.insert("old_string".into(), json!("world"));
        args.insert("new_string".into(), json!("rust"));
        let result = skill.execute(args).await;

        assert!(result.success());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello rust");
    }

    #[tokio::test]
    async fn ambiguous_match_without_replace_all_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "foo foo").unwrap();
        let skill = EditSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), json!("a.txt"));
        args.insert("old_string".into(), json!("foo"));
        args.insert("new_string".into(), json!("bar"));
        let result = skill.execute(args).await;

        assert!(!result.success());
        assert!(result.error.contains("unique"));
    }

    #[tokio::test]
    async fn replace_all_replaces_every_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "foo foo").unwrap();
        let skill = EditSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), json!("a.txt"));
        args.insert("old_string".into(), json!("foo"));
        args.insert("new_string".into(), json!("bar"));
        args.insert("replace_all".into(), json!(true));
        let result = skill.execute(args).await;

        assert!(result.success());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "bar bar");
    }
}
