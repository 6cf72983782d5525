//! Glob skill — fast file pattern matching, newest-first.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::GlobBuilder;
use nexus3_core::types::ToolResult;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

pub struct GlobSkill {
    workspace_root: PathBuf,
}

impl GlobSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            Arc::new(GlobSkill::new(root)) as Arc<dyn Skill>
        })
    }
}

const SKIP_DIRS: &[&str] = &["node_modules", "target"];

#[async_trait::async_trait]
impl Skill for GlobSkill {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern. Supports ** for recursive matching. \
         Returns file paths sorted by modification time (newest first)."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Glob pattern (e.g. '**/*.rs')"},
                "path": {"type": "string", "description": "Directory to search in (default: workspace root)"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(pattern) = args.get("pattern").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: pattern");
        };

        let search_root = args
            .get("path")
            .and_then(Value::as_str)
            .map(|p| if Path::new(p).is_absolute() { PathBuf::from(p) } else { self.workspace_root.join(p) })
            .unwrap_or_else(|| self.workspace_root.clone());

        let glob = match GlobBuilder::new(pattern).literal_separator(false).build() {
            Ok(g) => g.compile_matcher(),
            Err(e) => return ToolResult::err(format!("Invalid glob pattern: {e}")),
        };

        let mut matches: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        for entry in WalkDir::new(&search_root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
            })
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(&search_root).unwrap_or(entry.path());
                if glob.is_match(rel) {
                    let mtime = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    matches.push((entry.path().to_path_buf(), mtime));
                }
            }
        }

        matches.sort_by(|a, b| b.1.cmp(&a.1));
        debug!(pattern, matches = matches.len(), "glob");

        if matches.is_empty() {
            ToolResult::ok("No files found")
        } else {
            let result: Vec<String> =
                matches.iter().take(1000).map(|(p, _)| p.to_string_lossy().to_string()).collect();
            ToolResult::ok(result.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_matching_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();
        let skill = GlobSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("pattern".into(), json!("**/*.rs"));
        let result = skill.execute(args).await;

        assert!(result.success());
        assert!(result.output.contains("main.rs"));
        assert!(!result.output.contains("README.md"));
    }

    #[tokio::test]
    async fn no_matches_returns_friendly_message() {
        let dir = tempfile::tempdir().unwrap();
        let skill = GlobSkill::new(dir.path());
        let mut args = serde_json::Map::new();
        args.insert("pattern".into(), json!("*.nonexistent"));
        let result = skill.execute(args).await;
        assert_eq!(result.output, "No files found");
    }
}
