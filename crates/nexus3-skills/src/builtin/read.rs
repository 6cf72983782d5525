//! Read skill — read file contents with optional offset/limit.

use std::path::{Path, PathBuf};

use nexus3_core::types::ToolResult;
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

use crate::registry::Skill;
use crate::services::ServicesBag;

pub struct ReadSkill {
    workspace_root: PathBuf,
}

impl ReadSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> crate::registry::SkillFactory {
        std::sync::Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            std::sync::Arc::new(ReadSkill::new(root)) as std::sync::Arc<dyn Skill>
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        let expanded = if let Some(rest) = path.strip_prefix("~/") {
            dirs_home().unwrap_or_default().join(rest)
        } else if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        };
        expanded.canonicalize().unwrap_or(expanded)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[async_trait::async_trait]
impl Skill for ReadSkill {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Returns numbered lines. Use offset/limit for large files."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Absolute or workspace-relative path to read"},
                "offset": {"type": "integer", "description": "Line number to start from (1-indexed)"},
                "limit": {"type": "integer", "description": "Maximum number of lines to read (default 2000)"}
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(path) = args.get("file_path").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: file_path");
        };

        let resolved = self.resolve_path(path);
        let content = match fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("Failed to read file: {e}")),
        };

        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(2000) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let start = offset.saturating_sub(1).min(lines.len());
        let end = (start + limit).min(lines.len());

        let result: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect();

        debug!(path, lines = end - start, offset, "read");
        ToolResult::ok(result.join("\n"))
    }
}
