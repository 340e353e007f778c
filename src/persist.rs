//! On-disk snapshot files.
//!
//! Every file is replaced atomically: serialise to a hidden sibling temp
//! file, `fsync`, then `rename` over the target. Files are created `0600`
//! and directories `0700` on Unix. A missing file reads as `None`; an
//! unparseable one is reported as [`VaultError::CorruptState`] rather than
//! silently treated as empty.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::crypto;
use crate::error::{VaultError, VaultResult};

/// Create `dir` (and parents) restricted to the owner.
pub(crate) fn ensure_dir(dir: &Path) -> VaultResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir)?;

    #[cfg(unix)]
    {
        let mode = fs::metadata(dir)?.permissions().mode() & 0o777;
        if mode != 0o700 {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn open_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path)
}

/// Atomically replace `path` with `bytes`.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp = temp_path(path);
    {
        let mut file = open_private(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), len = bytes.len(), "snapshot written");
    Ok(())
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> VaultResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes)
}

/// Read a file, or `None` if it does not exist.
pub(crate) fn read_bytes(path: &Path) -> VaultResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read and parse a JSON snapshot, or `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> VaultResult<Option<T>> {
    let Some(bytes) = read_bytes(path)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| VaultError::CorruptState {
            path: path.to_path_buf(),
            source,
        })
}

/// Overwrite a file in place with random bytes of equal length, flush to
/// disk, then unlink it. The write goes to the existing inode (no rename)
/// so the old contents are actually replaced.
pub(crate) fn shred_file(path: &Path) -> VaultResult<()> {
    let len = fs::metadata(path)?.len() as usize;
    {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(&crypto::random_bytes(len)?)?;
        file.sync_all()?;
    }
    fs::remove_file(path)?;
    Ok(())
}
