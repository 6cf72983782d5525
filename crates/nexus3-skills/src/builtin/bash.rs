//! Bash skill — execute a shell command with a timeout and cooperative
//! cancellation that kills the child process immediately rather than
//! waiting for it to exit on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nexus3_core::types::ToolResult;
use nexus3_core::CancellationToken;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::cancel_wait::wait_cancelled;
use crate::registry::{Skill, SkillFactory};
use crate::services::ServicesBag;

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TIMEOUT_SECS: u64 = 600;
const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct BashSkill {
    workspace_root: PathBuf,
}

impl BashSkill {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self { workspace_root: workspace_root.as_ref().to_path_buf() }
    }

    pub fn factory() -> SkillFactory {
        Arc::new(|services: &ServicesBag| {
            let root = services.get_string("workspace_root").unwrap_or_else(|| ".".to_string());
            Arc::new(BashSkill::new(root)) as Arc<dyn Skill>
        })
    }

    /// Runs with cancellation support, killing the child immediately if
    /// `cancel` fires. The Session loop calls this instead of `execute`
    /// when it holds a live cancellation token for the in-flight tool call.
    pub async fn execute_cancellable(
        &self,
        args: serde_json::Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return ToolResult::err("Missing required parameter: command");
        };
        let timeout_secs =
            args.get("timeout").and_then(Value::as_u64).unwrap_or(DEFAULT_TIMEOUT_SECS).min(MAX_TIMEOUT_SECS);

        debug!(command = &command[..command.len().min(80)], "bash (cancellable)");

        let mut child = match Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("Failed to spawn: {e}")),
        };

        let timeout_duration = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            result = tokio::time::timeout(timeout_duration, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = read_pipe(child.stdout.take()).await;
                        let stderr = read_pipe(child.stderr.take()).await;
                        format_output(status, &stdout, &stderr)
                    }
                    Ok(Err(e)) => ToolResult::err(format!("Failed to wait: {e}")),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolResult::err(format!("Command timed out after {timeout_secs}s"))
                    }
                }
            }
            _ = wait_cancelled(&cancel) => {
                let _ = child.kill().await;
                ToolResult::ok("[process killed by interrupt]")
            }
        }
    }
}

async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        }
        None => String::new(),
    }
}

fn format_output(status: std::process::ExitStatus, stdout: &str, stderr: &str) -> ToolResult {
    let result = if status.success() {
        if stderr.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n{}", stdout.trim(), stderr.trim())
        }
    } else {
        format!("Exit code: {}\n{}\n{}", status.code().unwrap_or(-1), stdout.trim(), stderr.trim())
    };

    if result.is_empty() {
        ToolResult::ok("(no output)")
    } else if result.len() > MAX_OUTPUT_CHARS {
        ToolResult::ok(format!("{}\n... [truncated, {} total chars]", &result[..MAX_OUTPUT_CHARS], result.len()))
    } else {
        ToolResult::ok(result)
    }
}

#[async_trait::async_trait]
impl Skill for BashSkill {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command. Use for git, npm, docker, system commands. \
         Captures stdout and stderr. Set timeout in seconds (default 120). \
         Include a short description of what the command does."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The bash command to execute"},
                "timeout": {"type": "integer", "description": "Timeout in seconds (default 120, max 600)"},
                "description": {"type": "string", "description": "Short description of what this command does"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        self.execute_cancellable(args, CancellationToken::new()).await
    }
}
