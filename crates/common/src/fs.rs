//! Private atomic file writes
//!
//! Both on-disk stores hold tokens or account identity, so every write goes
//! through a temp file in the target directory, gets 0600 permissions, then is
//! renamed over the target. Readers in other processes never see a partial
//! file.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Write `contents` to `path` atomically, creating the parent directory if
/// needed.
pub async fn write_private_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        Some(_) => std::path::PathBuf::from("."),
        None => return Err(Error::NoParent(path.to_path_buf())),
    };
    let write_err = |source| Error::Write {
        path: path.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(&dir).await.map_err(write_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(write_err)?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(write_err(e));
    }

    debug!(path = %path.display(), bytes = contents.len(), "persisted file");
    Ok(())
}
