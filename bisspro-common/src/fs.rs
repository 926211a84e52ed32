//! Atomic file writes
//!
//! Every persisted file (key store, restored backups, TOML config) goes
//! through [`write_atomic`]: contents land in a sibling `<name>.tmp` file,
//! are flushed to disk, then renamed over the target. A crash mid-write
//! leaves either the old file or the new one, never a truncated mix.

use crate::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sibling temp path used while writing `target`
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name: OsString = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("unnamed"));
    name.push(".tmp");
    target.with_file_name(name)
}

/// Write `contents` to `target` via temp file + rename
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_inner(target, contents, None)
}

/// Same as [`write_atomic`] but restricts permissions to 0600 on unix
pub fn write_atomic_private(target: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_inner(target, contents, Some(0o600))
}

fn write_atomic_inner(target: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp = temp_path_for(target);
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(Error::Io(e));
    }

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&temp, fs::Permissions::from_mode(mode)) {
            warn!(path = %temp.display(), error = %e, "Failed to restrict file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Err(e) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(Error::Io(e));
    }

    debug!(path = %target.display(), bytes = contents.len(), "Atomic write complete");
    Ok(())
}
