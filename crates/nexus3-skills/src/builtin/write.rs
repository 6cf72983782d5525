//! Write skill — create or overwrite a file, creating parent directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nexus3_core::types::ToolResult;
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

pub struct WriteSkill {
    workspace_root: PathBuf,
}

impl WriteSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            Arc::new(WriteSkill::new(root)) as Arc<dyn Skill>
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
impl Skill for WriteSkill {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates parent directories if needed. \
         Overwrites the file if it exists. Prefer edit for modifications."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path to the file to write"},
                "content": {"type": "string", "description": "Content to write to the file"}
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(path) = args.get("file_path").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: file_path");
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: content");
        };

        let full_path = self.resolve(path);
        if let Some(parent) = full_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::err(format!("Failed to create directories: {e}"));
            }
        }

        match fs::write(&full_path, content).await {
            Ok(()) => {
                debug!(path, bytes = content.len(), "write");
                ToolResult::ok(format!("Wrote {} bytes to {}", content.len(), path))
            }
            Err(e) => ToolResult::err(format!("Failed to write: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let skill = WriteSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), json!("nested/out.txt"));
        args.insert("content".into(), json!("hello"));
        let result = skill.execute(args).await;

        assert!(result.success());
        assert_eq!(std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn missing_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let skill = WriteSkill::new(dir.path());
        let mut args = serde_json::Map::new();
        args.insert("file_path".into(), json!("a.txt"));
        let result = skill.execute(args).await;
        assert!(!result.success());
    }
}
