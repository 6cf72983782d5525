//! Permission Policy: three permission levels, a fixed classification of
//! tool intents into destructive/safe, per-tool overrides, and path/network
//! predicates. Blocked paths always override allowed paths; overrides are
//! consulted before falling back to the level's default.

use std::path::Path;

use crate::types::{AgentPermissions, PermissionLevel};

/// Tools whose names contain one of these substrings are treated as
/// destructive (require confirmation under Trusted, disabled under
/// Sandboxed unless explicitly re-enabled via an override).
const DESTRUCTIVE_ACTIONS: &[&str] = &["write", "delete", "execute", "exec", "bash", "remove", "move"];
const SAFE_ACTIONS: &[&str] = &["read", "list", "search", "grep", "glob", "status"];

/// Sandboxed agents may never call these regardless of overrides.
const SANDBOXED_DISABLED_TOOLS: &[&str] = &["bash", "execute"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolIntent {
    Destructive,
    Safe,
}

/// Classifies a tool by name, case-insensitively. Tools matching neither
/// list default to `Safe` — an unclassified tool is not treated as more
/// dangerous than a known-safe one, matching the closed-set framing (only
/// the named destructive actions require confirmation).
pub fn classify_tool(tool_name: &str) -> ToolIntent {
    let lower = tool_name.to_lowercase();
    if DESTRUCTIVE_ACTIONS.iter().any(|a| lower.contains(a)) {
        ToolIntent::Destructive
    } else {
        let _ = SAFE_ACTIONS; // documents the safe list even though it's the default arm
        ToolIntent::Safe
    }
}

pub struct PermissionPolicy {
    permissions: AgentPermissions,
}

impl PermissionPolicy {
    pub fn new(permissions: AgentPermissions) -> Self {
        Self { permissions }
    }

    pub fn level(&self) -> PermissionLevel {
        self.permissions.level
    }

    pub fn permissions(&self) -> &AgentPermissions {
        &self.permissions
    }

    /// Exposes the underlying permissions for confirmation-scope widening
    /// (AllowFile/AllowDirectory/AllowExecCwd/AllowExecGlobal): the Session
    /// loop caches a user's confirmation answer by mutating overrides or
    /// allowed paths directly rather than this type re-deriving every
    /// possible scope transition itself.
    pub fn permissions_mut(&mut self) -> &mut AgentPermissions {
        &mut self.permissions
    }

    fn override_enabled(&self, tool_name: &str) -> Option<bool> {
        self.permissions
            .tool_overrides
            .get(&tool_name.to_lowercase())
            .and_then(|o| o.enabled)
    }

    pub fn tool_timeout_ms(&self, tool_name: &str, default_ms: u64) -> u64 {
        self.permissions
            .tool_overrides
            .get(&tool_name.to_lowercase())
            .and_then(|o| o.timeout_ms)
            .unwrap_or(default_ms)
    }

    /// Whether the tool call is allowed to execute at all (before any
    /// confirmation prompt). Per-tool override wins over the level default,
    /// except that under Sandboxed the frozen disabled-tools set always
    /// wins over an *enabling* override — an override may disable a tool
    /// further, never re-enable one of these.
    pub fn allows_action(&self, tool_name: &str) -> bool {
        if self.permissions.level == PermissionLevel::Sandboxed {
            let lower = tool_name.to_lowercase();
            if SANDBOXED_DISABLED_TOOLS.iter().any(|t| lower.contains(t)) {
                return false;
            }
        }
        if let Some(enabled) = self.override_enabled(tool_name) {
            return enabled;
        }
        match self.permissions.level {
            PermissionLevel::Yolo => true,
            PermissionLevel::Trusted => true,
            PermissionLevel::Sandboxed => true,
        }
    }

    /// Whether a destructive call on this tool needs a confirmation
    /// round-trip. Sandboxed agents are never prompted — disallowed actions
    /// are simply refused, not confirmed.
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        if let Some(false) = self.override_enabled(tool_name) {
            return false;
        }
        match self.permissions.level {
            PermissionLevel::Yolo => false,
            PermissionLevel::Trusted => classify_tool(tool_name) == ToolIntent::Destructive,
            PermissionLevel::Sandboxed => false,
        }
    }

    fn path_blocked(&self, path: &Path) -> bool {
        self.permissions.blocked_paths.iter().any(|b| path.starts_with(b))
    }

    fn path_within_allowed(&self, path: &Path, default_allowed: &[std::path::PathBuf]) -> bool {
        match &self.permissions.allowed_paths {
            Some(allowed) => allowed.iter().any(|a| path.starts_with(a)),
            None => default_allowed.iter().any(|a| path.starts_with(a)),
        }
    }

    pub fn can_read_path(&self, path: &Path, cwd: &Path) -> bool {
        if self.path_blocked(path) {
            return false;
        }
        match self.permissions.level {
            PermissionLevel::Yolo => true,
            PermissionLevel::Trusted => {
                self.permissions.allowed_paths.is_none() || self.path_within_allowed(path, &[])
            }
            PermissionLevel::Sandboxed => self.path_within_allowed(path, std::slice::from_ref(&cwd.to_path_buf())),
        }
    }

    pub fn can_write_path(&self, path: &Path, cwd: &Path) -> bool {
        // Same rule set as reads; kept as a distinct method because a
        // future level could diverge the two, and the call sites read more
        // clearly naming their intent.
        self.can_read_path(path, cwd)
    }

    pub fn can_network(&self) -> bool {
        !matches!(self.permissions.level, PermissionLevel::Sandboxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolOverride;

    fn policy(level: PermissionLevel) -> PermissionPolicy {
        PermissionPolicy::new(AgentPermissions::new(level))
    }

    #[test]
    fn yolo_never_confirms_and_allows_everything() {
        let p = policy(PermissionLevel::Yolo);
        assert!(!p.requires_confirmation("write_file"));
        assert!(p.allows_action("bash"));
        assert!(p.can_network());
    }

    #[test]
    fn trusted_confirms_destructive_only() {
        let p = policy(PermissionLevel::Trusted);
        assert!(p.requires_confirmation("write_file"));
        assert!(!p.requires_confirmation("read_file"));
        assert!(p.allows_action("write_file"));
    }

    #[test]
    fn sandboxed_disables_without_prompting() {
        let p = policy(PermissionLevel::Sandboxed);
        assert!(!p.allows_action("bash"));
        assert!(!p.requires_confirmation("bash"));
        assert!(!p.can_network());
    }

    #[test]
    fn per_tool_override_wins_over_level() {
        let mut perms = AgentPermissions::new(PermissionLevel::Trusted);
        perms.tool_overrides.insert(
            "write_file".to_string(),
            ToolOverride { enabled: Some(false), timeout_ms: None },
        );
        let p = PermissionPolicy::new(perms);
        assert!(!p.allows_action("write_file"));
    }

    /// §4.2: `SANDBOXED_DISABLED_TOOLS` is a frozen set — an *enabling*
    /// override must not resurrect a tool on it, even though overrides
    /// otherwise win over the level default.
    #[test]
    fn sandboxed_frozen_tools_cannot_be_reenabled_by_override() {
        let mut perms = AgentPermissions::new(PermissionLevel::Sandboxed);
        perms.tool_overrides.insert(
            "bash".to_string(),
            ToolOverride { enabled: Some(true), timeout_ms: None },
        );
        let p = PermissionPolicy::new(perms);
        assert!(!p.allows_action("bash"));
    }

    /// An override may still *disable* a tool further under Sandboxed.
    #[test]
    fn sandboxed_override_can_still_disable_a_non_frozen_tool() {
        let mut perms = AgentPermissions::new(PermissionLevel::Sandboxed);
        perms.tool_overrides.insert(
            "read_file".to_string(),
            ToolOverride { enabled: Some(false), timeout_ms: None },
        );
        let p = PermissionPolicy::new(perms);
        assert!(!p.allows_action("read_file"));
    }

    #[test]
    fn blocked_paths_override_allowed_paths() {
        let mut perms = AgentPermissions::new(PermissionLevel::Trusted);
        perms.allowed_paths = Some(vec!["/workspace".into()]);
        perms.blocked_paths = vec!["/workspace/secrets".into()];
        let p = PermissionPolicy::new(perms);

        assert!(p.can_read_path(Path::new("/workspace/file.txt"), Path::new("/workspace")));
        assert!(!p.can_read_path(Path::new("/workspace/secrets/key"), Path::new("/workspace")));
    }

    #[test]
    fn sandboxed_defaults_path_scope_to_cwd() {
        let p = policy(PermissionLevel::Sandboxed);
        let cwd = Path::new("/workspace");
        assert!(p.can_read_path(Path::new("/workspace/file.txt"), cwd));
        assert!(!p.can_read_path(Path::new("/etc/passwd"), cwd));
    }
}
