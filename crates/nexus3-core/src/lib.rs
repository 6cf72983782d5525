//! Shared types and foundational primitives: cancellation, permissions,
//! error kinds, identifier rules, secret redaction, and the outbound URL
//! SSRF guard. Everything else builds on top of this crate.

pub mod cancel;
pub mod error;
pub mod identifiers;
pub mod permission;
pub mod redaction;
pub mod types;
pub mod url_validator;
pub mod validation;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use types::{
    AgentPermissions, ConfirmationResult, LogConfig, LogStream, Message, PermissionLevel, Role,
    SavedSession, SessionMarkers, SessionMode, SessionStatus, SessionType, StreamEvent, ToolCall,
    ToolOverride, ToolResult, SAVED_SESSION_SCHEMA_VERSION,
};
