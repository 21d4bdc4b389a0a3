/// Small-file persistence shared by the file-backed stores.
///
/// Writers hold an exclusive `fs2` lock on a sidecar `.lock` file and replace
/// the target atomically (temp file in the same directory, then rename), so
/// a concurrent reader sees either the old contents or the new ones, never a
/// partial write. Readers hold a shared lock on the same sidecar.
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{CoreError, Result};

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| CoreError::StorageFailure(format!("{} has no parent", path.display())))
}

fn open_lock(path: &Path) -> Result<File> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir).map_err(CoreError::storage)?;
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))
        .map_err(CoreError::storage)
}

/// Held advisory lock; released on drop.
pub struct FileLock {
    file: File,
}

impl FileLock {
    pub fn shared(path: &Path) -> Result<Self> {
        let file = open_lock(path)?;
        file.lock_shared().map_err(CoreError::storage)?;
        Ok(Self { file })
    }

    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock(path)?;
        file.lock_exclusive().map_err(CoreError::storage)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Read a file; `Ok(None)` when it does not exist. Caller holds the lock.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::storage(e)),
    }
}

/// Atomically replace `path` with `bytes`, owner-only permissions on Unix.
/// Caller holds the exclusive lock.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir).map_err(CoreError::storage)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(CoreError::storage)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(CoreError::storage)?;
    }
    tmp.write_all(bytes).map_err(CoreError::storage)?;
    tmp.as_file().sync_all().map_err(CoreError::storage)?;
    tmp.persist(path).map_err(|e| CoreError::storage(e.error))?;
    Ok(())
}

/// Remove a file if present. Caller holds the exclusive lock.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::storage(e)),
    }
}
