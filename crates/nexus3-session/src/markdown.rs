//! MarkdownWriter half of C8: append-only, human-readable `context.md` /
//! `verbose.md` transcripts.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use nexus3_core::types::{Message, Role, ToolCall, ToolResult};

use crate::error::Result;
use crate::fs_guard;

const TOOL_OUTPUT_TRUNCATE_CHARS: usize = 2000;

pub struct MarkdownWriter {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl MarkdownWriter {
    /// Opens (creating with a header if absent) the markdown file at
    /// `path`, refusing to traverse any symlink on the way.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists();
        let mut file = fs_guard::open_append_no_symlink(&path)?;
        if is_new {
            writeln!(file, "# Session Transcript\n")?;
        }
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, text: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn write_system(&self, content: &str) -> Result<()> {
        self.append(&format!("## System\n\n{content}\n\n"))
    }

    pub fn write_user(&self, content: &str) -> Result<()> {
        self.append(&format!("## User [{}]\n\n{content}\n\n", timestamp()))
    }

    pub fn write_assistant(&self, content: &str, tool_calls: &[ToolCall]) -> Result<()> {
        let mut text = format!("## Assistant [{}]\n\n{content}\n\n", timestamp());
        if !tool_calls.is_empty() {
            text.push_str("### Tool Calls\n\n");
            for call in tool_calls {
                let args = serde_json::Value::Object(call.arguments.clone());
                text.push_str(&format!("- `{}`({})\n", call.name, args));
            }
            text.push('\n');
        }
        self.append(&text)
    }

    pub fn write_tool_result(&self, name: &str, result: &ToolResult) -> Result<()> {
        let status = if result.success() { "success" } else { "error" };
        let body = truncate_for_display(result.to_content());
        self.append(&format!("### Tool Result: {name} ({status})\n\n{body}\n\n"))
    }

    /// Convenience entry point mirroring the Context stream: writes the
    /// right section for a `Message`'s role.
    pub fn write_message(&self, message: &Message) -> Result<()> {
        match message.role {
            Role::System => self.write_system(&message.content),
            Role::User => self.write_user(&message.content),
            Role::Assistant => self.write_assistant(&message.content, &message.tool_calls),
            Role::Tool => {
                let result = ToolResult::ok(message.content.clone());
                self.write_tool_result(message.tool_call_id.as_deref().unwrap_or("unknown"), &result)
            }
        }
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn truncate_for_display(text: &str) -> String {
    if text.chars().count() <= TOOL_OUTPUT_TRUNCATE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(TOOL_OUTPUT_TRUNCATE_CHARS).collect();
    format!("{truncated} (truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_header_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.md");
        {
            let writer = MarkdownWriter::open(&path).unwrap();
            writer.write_user("hello").unwrap();
        }
        let writer = MarkdownWriter::open(&path).unwrap();
        writer.write_user("again").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("# Session Transcript").count(), 1);
        assert!(content.contains("hello"));
        assert!(content.contains("again"));
    }

    #[test]
    fn tool_output_is_truncated_at_2000_chars() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MarkdownWriter::open(dir.path().join("context.md")).unwrap();
        let long_output = "x".repeat(5000);
        writer.write_tool_result("read", &ToolResult::ok(long_output)).unwrap();

        let content = std::fs::read_to_string(dir.path().join("context.md")).unwrap();
        assert!(content.contains("(truncated)"));
        assert!(!content.contains(&"x".repeat(2001)));
    }

    #[test]
    fn tool_result_section_reports_success_or_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MarkdownWriter::open(dir.path().join("context.md")).unwrap();
        writer.write_tool_result("bash", &ToolResult::err("boom")).unwrap();

        let content = std::fs::read_to_string(dir.path().join("context.md")).unwrap();
        assert!(content.contains("### Tool Result: bash (error)"));
    }
}
