//! Validation and normalization rules for skill/tool names and agent ids.
//!
//! Tool names are validated strictly (reject anything that doesn't already
//! conform); external names (MCP-provided) go through `normalize_tool_name`
//! first, which is permissive by construction — path separators, shell
//! metacharacters and homoglyphs all collapse to underscores.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub const MAX_TOOL_NAME_LENGTH: usize = 64;

fn valid_tool_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,63}$").unwrap())
}

fn invalid_char_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_-]").unwrap())
}

fn consecutive_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[_-]{2,}").unwrap())
}

fn agent_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\.?[A-Za-z0-9][A-Za-z0-9._-]{0,61}$").unwrap())
}

pub fn reserved_tool_names() -> &'static [&'static str] {
    &["true", "false", "null", "none", "system", "admin", "root", "mcp", "nexus"]
}

/// Internal parameters that are allowed to ride along on a tool call's
/// argument map without being subject to schema validation or the strict
/// reject-unknown-keys rule. Exactly `_parallel`, nothing broader.
pub const ALLOWED_INTERNAL_PARAMS: &[&str] = &["_parallel"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ToolNameError {
    #[error("tool name must not be empty")]
    Empty,
    #[error("tool name exceeds {MAX_TOOL_NAME_LENGTH} characters")]
    TooLong,
    #[error("tool name '{0}' does not match the required pattern")]
    InvalidPattern(String),
    #[error("tool name '{0}' is reserved")]
    Reserved(String),
}

pub fn is_valid_tool_name(name: &str) -> bool {
    validate_tool_name(name, false).is_ok()
}

/// Strict validator used for statically-declared, first-party skill names.
/// `allow_reserved` exists for internal callers (e.g. the registry itself
/// registering a skill literally named `system`) but is false everywhere
/// else.
pub fn validate_tool_name(name: &str, allow_reserved: bool) -> Result<(), ToolNameError> {
    if name.is_empty() {
        return Err(ToolNameError::Empty);
    }
    if name.len() > MAX_TOOL_NAME_LENGTH {
        return Err(ToolNameError::TooLong);
    }
    if !valid_tool_name_re().is_match(name) {
        return Err(ToolNameError::InvalidPattern(name.to_string()));
    }
    if !allow_reserved && reserved_tool_names().contains(&name.to_lowercase().as_str()) {
        return Err(ToolNameError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Normalizes an externally-sourced name (e.g. from an MCP server) into a
/// valid tool name: NFKC-fold, lowercase, replace any character outside
/// `[a-z0-9_-]` with `_`, collapse consecutive separators, strip leading and
/// trailing separators, and prefix a leading digit with `_`.
///
/// `prefix` (e.g. `mcp_myserver_`) is applied last and its length is
/// reserved out of the budget so the final name never exceeds
/// `MAX_TOOL_NAME_LENGTH`.
pub fn normalize_tool_name(name: &str, prefix: &str) -> String {
    let folded: String = name.nfkc().collect();
    let lowered = folded.to_lowercase();
    let replaced = invalid_char_re().replace_all(&lowered, "_").to_string();
    let collapsed = consecutive_separator_re().replace_all(&replaced, "_").to_string();
    let trimmed = collapsed.trim_matches(|c| c == '_' || c == '-').to_string();

    let digit_fixed = if trimmed.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        format!("_{trimmed}")
    } else {
        trimmed
    };

    let budget = MAX_TOOL_NAME_LENGTH.saturating_sub(prefix.len());
    let body: String = digit_fixed.chars().take(budget.max(1)).collect();
    let body = if body.is_empty() { "_".to_string() } else { body };

    format!("{prefix}{body}")
}

/// Builds the canonical skill name exposed for a tool imported from an MCP
/// server: `mcp_{safe_server}_{normalized_tool}`.
pub fn build_mcp_skill_name(server_name: &str, tool_name: &str) -> String {
    let safe_server = normalize_tool_name(server_name, "");
    normalize_tool_name(tool_name, &format!("mcp_{safe_server}_"))
}

/// Splits an `mcp_{server}_{tool}`-shaped name back into its two parts by
/// finding the first underscore after the `mcp_` prefix. This is
/// intentionally lossy: a server name containing an underscore makes the
/// split ambiguous, so this should only be used for display purposes, never
/// to reconstruct a dispatch key.
pub fn parse_mcp_skill_name(skill_name: &str) -> Option<(String, String)> {
    let rest = skill_name.strip_prefix("mcp_")?;
    let (server, tool) = rest.split_once('_')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server.to_string(), tool.to_string()))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentIdError {
    #[error("agent id must not be empty")]
    Empty,
    #[error("agent id must not be '.' or '..'")]
    DotSegment,
    #[error("agent id must not contain a path separator")]
    PathSeparator,
    #[error("agent id '{0}' does not match the required pattern")]
    InvalidPattern(String),
}

/// `^\.?[a-zA-Z0-9][a-zA-Z0-9._-]{0,61}$` — a leading `.` marks an ephemeral
/// temp agent; everything else must start alphanumeric.
pub fn validate_agent_id(agent_id: &str) -> Result<(), AgentIdError> {
    if agent_id.is_empty() {
        return Err(AgentIdError::Empty);
    }
    if agent_id == "." || agent_id == ".." {
        return Err(AgentIdError::DotSegment);
    }
    if agent_id.contains('/') || agent_id.contains('\\') {
        return Err(AgentIdError::PathSeparator);
    }
    if !agent_id_re().is_match(agent_id) {
        return Err(AgentIdError::InvalidPattern(agent_id.to_string()));
    }
    Ok(())
}

pub fn is_valid_agent_id(agent_id: &str) -> bool {
    validate_agent_id(agent_id).is_ok()
}

pub fn is_temp_agent_id(agent_id: &str) -> bool {
    agent_id.starts_with('.')
}
