//! Grep skill — regex content search across files, with files/content/count
//! output modes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nexus3_core::types::ToolResult;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

pub struct GrepSkill {
    workspace_root: PathBuf,
}

impl GrepSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            Arc::new(GrepSkill::new(root)) as Arc<dyn Skill>
        })
    }
}

const SKIP_DIRS: &[&str] = &["node_modules", "target"];
const MAX_RESULTS: usize = 5000;

#[async_trait::async_trait]
impl Skill for GrepSkill {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents using regex patterns. Returns matching file paths by default, \
         or matching lines with context. Use glob to filter files."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regex pattern to search for"},
                "path": {"type": "string", "description": "File or directory to search (default: workspace root)"},
                "glob": {"type": "string", "description": "Glob pattern to filter files"},
                "output_mode": {
                    "type": "string",
                    "enum": ["files_with_matches", "content", "count"],
                    "description": "Output mode (default: files_with_matches)"
                },
                "case_insensitive": {"type": "boolean", "description": "Case insensitive search (default: false)"},
                "context": {"type": "integer", "description": "Lines of context around matches (content mode)"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let Some(pattern_str) = args.get("pattern").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: pattern");
        };

        let case_insensitive = args.get("case_insensitive").and_then(Value::as_bool).unwrap_or(false);
        let regex_pattern =
            if case_insensitive { format!("(?i){pattern_str}") } else { pattern_str.to_string() };
        let regex = match Regex::new(&regex_pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::err(format!("Invalid regex: {e}")),
        };

        let search_root = args
            .get("path")
            .and_then(Value::as_str)
            .map(|p| if Path::new(p).is_absolute() { PathBuf::from(p) } else { self.workspace_root.join(p) })
            .unwrap_or_else(|| self.workspace_root.clone());

        let output_mode = args.get("output_mode").and_then(Value::as_str).unwrap_or("files_with_matches");
        let context_lines = args.get("context").and_then(Value::as_u64).unwrap_or(0) as usize;

        let file_glob = args.get("glob").and_then(Value::as_str).and_then(|g| {
            globset::GlobBuilder::new(g).literal_separator(false).build().ok().map(|g| g.compile_matcher())
        });

        if search_root.is_file() {
            return search_file(&search_root, &regex, output_mode, context_lines);
        }

        let mut results = Vec::new();

        for entry in WalkDir::new(&search_root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref())
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(ref glob) = file_glob {
                let name = entry.file_name().to_string_lossy();
                if !glob.is_match(name.as_ref()) {
                    continue;
                }
            }
            if let Ok(bytes) = std::fs::read(entry.path()) {
                if bytes.len() > 512 && bytes[..512].contains(&0) {
                    continue;
                }
            } else {
                continue;
            }

            let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
            if !regex.is_match(&content) {
                continue;
            }

            match output_mode {
                "count" => {
                    let count = regex.find_iter(&content).count();
                    results.push(format!("{}:{}", entry.path().display(), count));
                }
                "content" => push_content_matches(&mut results, entry.path(), &content, &regex, context_lines),
                _ => results.push(entry.path().to_string_lossy().to_string()),
            }

            if results.len() > MAX_RESULTS {
                break;
            }
        }

        debug!(pattern = pattern_str, results = results.len(), "grep");

        if results.is_empty() {
            ToolResult::ok("No matches found")
        } else {
            ToolResult::ok(results.join("\n"))
        }
    }
}

fn push_content_matches(
    results: &mut Vec<String>,
    path: &Path,
    content: &str,
    regex: &Regex,
    context_lines: usize,
) {
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if !regex.is_match(line) {
            continue;
        }
        let start = i.saturating_sub(context_lines);
        let end = (i + context_lines + 1).min(lines.len());
        for j in start..end {
            let prefix = if j == i { ">" } else { " " };
            results.push(format!("{}{}:{}:{}", prefix, path.display(), j + 1, lines[j]));
        }
        if context_lines > 0 && end < lines.len() {
            results.push("--".to_string());
        }
    }
}

fn search_file(path: &Path, regex: &Regex, output_mode: &str, context_lines: usize) -> ToolResult {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return ToolResult::err(format!("Failed to read: {e}")),
    };

    if !regex.is_match(&content) {
        return ToolResult::ok("No matches found");
    }

    match output_mode {
        "count" => ToolResult::ok(regex.find_iter(&content).count().to_string()),
        "files_with_matches" => ToolResult::ok(path.to_string_lossy().to_string()),
        _ => {
            let mut results = Vec::new();
            let lines: Vec<&str> = content.lines().collect();
            for (i, line) in lines.iter().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                let start = i.saturating_sub(context_lines);
                let end = (i + context_lines + 1).min(lines.len());
                for j in start..end {
                    let prefix = if j == i { ">" } else { " " };
                    results.push(format!("{}{}:{}", prefix, j + 1, lines[j]));
                }
                if context_lines > 0 {
                    results.push("--".to_string());
                }
            }
            ToolResult::ok(results.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\n").unwrap();
        std::fs::write(dir.path().join("b.rs"), "struct Foo;\n").unwrap();
        let skill = GrepSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("pattern".into(), json!("fn main"));
        let result = skill.execute(args).await;

        assert!(result.output.contains("a.rs"));
        assert!(!result.output.contains("b.rs"));
    }

    #[tokio::test]
    async fn content_mode_includes_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let skill = GrepSkill::new(dir.path());

        let mut args = serde_json::Map::new();
        args.insert("pattern".into(), json!("beta"));
        args.insert("output_mode".into(), json!("content"));
        let result = skill.execute(args).await;

        assert!(result.output.contains(":2:beta"));
    }

    #[tokio::test]
    async fn invalid_regex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let skill = GrepSkill::new(dir.path());
        let mut args = serde_json::Map::new();
        args.insert("pattern".into(), json!("(unclosed"));
        let result = skill.execute(args).await;
        assert!(!result.success());
    }
}
