//! Session Persistence (C11): atomic, symlink-safe reads/writes of
//! `SavedSession` JSON under `{state_dir}/sessions/`, plus the "last
//! session" pointer files the REPL uses to resume on restart.
//! `state_dir` is the caller's fully-resolved `${NEXUS_HOME:=~/.nexus3}`
//! — this module never appends `.nexus3` itself.

use std::path::{Path, PathBuf};

use nexus3_core::identifiers::validate_agent_id;
use nexus3_core::types::SavedSession;

use crate::error::{Result, SessionError};
use crate::fs_guard;

pub struct SessionPersistence {
    state_dir: PathBuf,
}

impl SessionPersistence {
    /// `state_dir` must already be the fully-resolved `${NEXUS_HOME:=~/.nexus3}`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into() }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    fn session_path(&self, name: &str) -> Result<PathBuf> {
        validate_agent_id(name).map_err(|e| SessionError::Persistence(format!("invalid session name: {e}")))?;
        Ok(self.sessions_dir().join(format!("{name}.json")))
    }

    fn last_session_pointer(&self) -> PathBuf {
        self.state_dir.join("last-session.json")
    }

    fn last_session_name_file(&self) -> PathBuf {
        self.state_dir.join("last-session-name")
    }

    /// Atomically writes `saved` to `{name}.json`: temp file in the same
    /// directory at 0o600, fsync, rename over the target. Also updates the
    /// "last session" pointer and its sibling name file. Refuses outright
    /// if any path component is a symlink.
    pub async fn save(&self, name: &str, saved: &SavedSession) -> Result<()> {
        let path = self.session_path(name)?;
        tokio::fs::create_dir_all(self.sessions_dir()).await?;
        fs_guard::set_owner_only_dir(&self.sessions_dir());

        let json = saved.to_json().map_err(SessionError::Core)?;
        atomic_write(&path, json.as_bytes()).await?;

        let pointer_json = saved.to_json().map_err(SessionError::Core)?;
        atomic_write(&self.last_session_pointer(), pointer_json.as_bytes()).await?;
        atomic_write(&self.last_session_name_file(), name.as_bytes()).await?;

        Ok(())
    }

    /// Reads and deserializes `{name}.json`. A missing file is a dedicated
    /// `SessionNotFound` rather than a raw IO error.
    pub async fn load(&self, name: &str) -> Result<SavedSession> {
        let path = self.session_path(name)?;
        if !path.exists() {
            return Err(SessionError::SessionNotFound(name.to_string()));
        }
        fs_guard::ensure_no_symlinks(&path)?;
        let data = tokio::fs::read_to_string(&path).await?;
        SavedSession::from_json(&data).map_err(SessionError::Core)
    }

    pub async fn last_session_name(&self) -> Result<Option<String>> {
        let path = self.last_session_name_file();
        if !path.exists() {
            return Ok(None);
        }
        let name = tokio::fs::read_to_string(&path).await?;
        Ok(Some(name.trim().to_string()))
    }

    pub fn session_exists(&self, name: &str) -> bool {
        self.session_path(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Atomic copy with duplicate-destination rejection.
    pub async fn clone_session(&self, source: &str, dest: &str) -> Result<()> {
        let dest_path = self.session_path(dest)?;
        if dest_path.exists() {
            return Err(SessionError::Persistence(format!("destination session already exists: {dest}")));
        }
        let saved = self.load(source).await?;
        self.save(dest, &saved).await
    }

    /// Atomic rename with duplicate-destination rejection. The source
    /// session no longer exists afterward.
    pub async fn rename_session(&self, source: &str, dest: &str) -> Result<()> {
        let source_path = self.session_path(source)?;
        let dest_path = self.session_path(dest)?;
        if dest_path.exists() {
            return Err(SessionError::Persistence(format!("destination session already exists: {dest}")));
        }
        fs_guard::ensure_no_symlinks(&source_path)?;
        fs_guard::ensure_no_symlinks(&dest_path)?;
        tokio::fs::rename(&source_path, &dest_path).await?;
        Ok(())
    }
}

async fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    fs_guard::ensure_no_symlinks(target)?;

    let dir = target.parent().ok_or_else(|| SessionError::Persistence("target has no parent directory".into()))?;
    let file_name = target.file_name().ok_or_else(|| SessionError::Persistence("target has no file name".into()))?;
    let tmp_path = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    fs_guard::ensure_no_symlinks(&tmp_path)?;

    {
        let mut file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        use std::io::Write;
        file.write_all(data)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent_id: &str) -> SavedSession {
        SavedSession {
            schema_version: nexus3_core::types::SAVED_SESSION_SCHEMA_VERSION,
            agent_id: agent_id.to_string(),
            created_at: 1.0,
            modified_at: 1.0,
            messages: Vec::new(),
            system_prompt: "you are helpful".to_string(),
            system_prompt_path: None,
            working_directory: "/tmp".to_string(),
            permission_level: nexus3_core::types::PermissionLevel::Trusted,
            permission_preset: None,
            disabled_tools: Vec::new(),
            token_usage: None,
            provenance: "user".to_string(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        store.save("alice", &sample("alice")).await.unwrap();

        let loaded = store.load("alice").await.unwrap();
        assert_eq!(loaded.agent_id, "alice");
    }

    #[tokio::test]
    async fn load_missing_session_is_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        let err = store.load("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn rejects_session_names_with_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        let err = store.save("../escape", &sample("escape")).await.unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
    }

    #[tokio::test]
    async fn save_updates_last_session_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        store.save("alice", &sample("alice")).await.unwrap();

        assert_eq!(store.last_session_name().await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn clone_rejects_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        store.save("alice", &sample("alice")).await.unwrap();
        store.save("bob", &sample("bob")).await.unwrap();

        let err = store.clone_session("alice", "bob").await.unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
    }

    #[tokio::test]
    async fn clone_then_rename_work_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionPersistence::new(dir.path());
        store.save("alice", &sample("alice")).await.unwrap();

        store.clone_session("alice", "alice-copy").await.unwrap();
        assert!(store.session_exists("alice-copy"));

        store.rename_session("alice-copy", "alice-renamed").await.unwrap();
        assert!(!store.session_exists("alice-copy"));
        assert!(store.session_exists("alice-renamed"));
    }
}
