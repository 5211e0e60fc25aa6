//! PTY recording files for the interactive mode.
//!
//! Recordings are raw PTY output bytes in arrival order, one file per
//! session named `<recording_path>/<session-uuid>.rec`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::ServerResult;

/// Create the recording directory at startup if it is absent (mode 0770).
pub fn ensure_recording_dir(path: &Path) -> ServerResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    Ok(())
}

/// Open a fresh recording file for one session (mode 0660).
pub fn create_recording(dir: &Path, session_id: Uuid) -> ServerResult<(tokio::fs::File, PathBuf)> {
    let path = dir.join(format!("{session_id}.rec"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))?;
    Ok((tokio::fs::File::from_std(file), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_directory_with_group_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("recordings");
        ensure_recording_dir(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
        // Re-running against an existing directory is fine.
        ensure_recording_dir(&dir).unwrap();
    }

    #[test]
    fn recording_files_are_group_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let (_file, path) = create_recording(tmp.path(), id).unwrap();
        assert_eq!(path, tmp.path().join(format!("{id}.rec")));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }
}
