//! Core data model shared by every other crate: messages, tool calls,
//! streaming events, permissions, session markers and the on-disk
//! `SavedSession` form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// An assistant message is a provider anomaly if it has neither content
    /// nor tool calls; callers must not append it to a Context.
    pub fn is_empty_assistant(&self) -> bool {
        self.role == Role::Assistant && self.content.is_empty() && self.tool_calls.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { output: output.into(), error: String::new() }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self { output: String::new(), error: error.into() }
    }

    pub fn success(&self) -> bool {
        self.error.is_empty()
    }

    /// The text that should become a Tool message's content: the error if
    /// present, otherwise the output.
    pub fn to_content(&self) -> &str {
        if self.success() {
            &self.output
        } else {
            &self.error
        }
    }
}

/// Streaming events emitted by a provider. A stream always terminates with
/// exactly one `StreamComplete`, including empty streams, which still
/// synthesize a `StreamComplete` carrying an empty message.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolCallStarted { index: usize, id: String, name: String },
    StreamComplete(Message),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Yolo,
    Trusted,
    Sandboxed,
}

impl PermissionLevel {
    /// The `"worker"` preset name is a backwards-compatible alias for
    /// `"sandboxed"`.
    pub fn from_preset_name(name: &str) -> Option<Self> {
        match name {
            "yolo" => Some(Self::Yolo),
            "trusted" => Some(Self::Trusted),
            "sandboxed" | "worker" => Some(Self::Sandboxed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentPermissions {
    pub level: PermissionLevel,
    #[serde(default)]
    pub tool_overrides: BTreeMap<String, ToolOverride>,
    #[serde(default)]
    pub allowed_paths: Option<Vec<std::path::PathBuf>>,
    #[serde(default)]
    pub blocked_paths: Vec<std::path::PathBuf>,
}

impl AgentPermissions {
    pub fn new(level: PermissionLevel) -> Self {
        Self {
            level,
            tool_overrides: BTreeMap::new(),
            allowed_paths: None,
            blocked_paths: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationResult {
    AllowOnce,
    AllowFile,
    AllowDirectory,
    AllowExecCwd,
    AllowExecGlobal,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Saved,
    Temp,
    Subagent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Destroyed,
    Orphaned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMarkers {
    pub session_type: SessionType,
    pub session_status: SessionStatus,
    pub parent_agent_id: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Stable on-disk schema. Unknown fields are ignored on load so future
/// fields can be added without breaking old readers; `schema_version`
/// drives any future migration.
pub const SAVED_SESSION_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedSession {
    pub schema_version: u32,
    pub agent_id: String,
    pub created_at: f64,
    pub modified_at: f64,
    pub messages: Vec<Message>,
    pub system_prompt: String,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
    pub working_directory: String,
    pub permission_level: PermissionLevel,
    #[serde(default)]
    pub permission_preset: Option<String>,
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    #[serde(default)]
    pub token_usage: Option<u64>,
    /// `"user"` or the parent agent id.
    pub provenance: String,
}

impl SavedSession {
    /// Deserialize, filtering out empty-assistant messages that may have
    /// leaked into storage before the in-memory guard existed (forward
    /// compatibility with the Context Manager's empty-assistant guard).
    pub fn from_json(data: &str) -> crate::error::Result<Self> {
        let mut saved: SavedSession = serde_json::from_str(data)
            .map_err(|e| crate::error::Error::persistence(format!("malformed SavedSession: {e}")))?;
        saved.messages.retain(|m| !m.is_empty_assistant());
        Ok(saved)
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

bitflags_like::bitflags_like! {
    /// Which log streams are active for a session.
    pub struct LogStream: u8 {
        const CONTEXT = 0b001;
        const VERBOSE = 0b010;
        const RAW     = 0b100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Repl,
    Serve,
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub base_dir: std::path::PathBuf,
    pub streams: LogStream,
    pub parent_session: Option<String>,
    pub mode: SessionMode,
    pub session_type: SessionType,
}

/// A tiny hand-rolled bitflags substitute, scoped to this one three-bit
/// flag set, so the crate doesn't pull in the `bitflags` macro crate for a
/// single type.
mod bitflags_like {
    macro_rules! bitflags_like {
        (
            $(#[$meta:meta])*
            pub struct $name:ident: $repr:ty {
                $(const $flag:ident = $value:expr;)*
            }
        ) => {
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
            pub struct $name(pub $repr);

            impl $name {
                $(pub const $flag: $name = $name($value);)*

                pub const fn empty() -> Self {
                    $name(0)
                }

                pub const fn contains(&self, other: $name) -> bool {
                    (self.0 & other.0) == other.0
                }
            }

            impl std::ops::BitOr for $name {
                type Output = $name;
                fn bitor(self, rhs: $name) -> $name {
                    $name(self.0 | rhs.0)
                }
            }

            impl std::ops::BitOrAssign for $name {
                fn bitor_assign(&mut self, rhs: $name) {
                    self.0 |= rhs.0;
                }
            }
        };
    }

    pub(crate) use bitflags_like;
}
