//! Symlink defense (Fix 2.2) shared by the Markdown/Raw Writers (C8) and
//! Session Persistence (C11): refuse to traverse or create through a
//! symlink anywhere on the path to a log or session file, so a planted
//! symlink can't redirect an append/write to an arbitrary location.

use std::path::{Path, PathBuf};

use crate::error::{Result, SessionError};

/// Checks that `path` itself (if it exists) and every existing ancestor
/// directory is not a symlink. Missing components are fine — the final
/// component in particular is expected not to exist on first write — but
/// a missing *parent directory* is an error rather than something we
/// silently create, per spec.
pub fn ensure_no_symlinks(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(SessionError::MissingParentDir(parent.to_path_buf()));
        }
    }

    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if let Ok(meta) = std::fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                return Err(SessionError::Symlink(current));
            }
        }
    }
    Ok(())
}

/// Opens `path` for appending, creating it if absent, after verifying no
/// path component is a symlink. Sets 0o600 on newly created files.
pub fn open_append_no_symlink(path: &Path) -> Result<std::fs::File> {
    ensure_no_symlinks(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    if !existed {
        set_owner_only_file(&file);
    }
    Ok(file)
}

#[cfg(unix)]
fn set_owner_only_file(file: &std::fs::File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_owner_only_file(_file: &std::fs::File) {}

#[cfg(unix)]
pub fn set_owner_only_dir(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
pub fn set_owner_only_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_symlinked_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.log");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link.log");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();
        #[cfg(unix)]
        {
            let err = open_append_no_symlink(&link).unwrap_err();
            assert!(matches!(err, SessionError::Symlink(_)));
        }
    }

    #[test]
    fn refuses_symlinked_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let real_dir = dir.path().join("real_dir");
        std::fs::create_dir(&real_dir).unwrap();
        let link_dir = dir.path().join("link_dir");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real_dir, &link_dir).unwrap();
        #[cfg(unix)]
        {
            let path = link_dir.join("context.md");
            let err = open_append_no_symlink(&path).unwrap_err();
            assert!(matches!(err, SessionError::Symlink(_)));
        }
    }

    #[test]
    fn missing_parent_dir_is_an_error_not_silently_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent").join("context.md");
        let err = open_append_no_symlink(&path).unwrap_err();
        assert!(matches!(err, SessionError::MissingParentDir(_)));
    }

    #[test]
    fn creates_new_file_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.md");
        let _file = open_append_no_symlink(&path).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
