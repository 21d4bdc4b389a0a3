/// Revocation record: token ids rejected before their natural expiry.
///
/// `revoke` must be visible to every `verify` that starts after it returns.
/// The memory store gets this from a single shared map; the file store by
/// re-reading the file under a shared lock on every check.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persist::{self, FileLock};

/// token id -> natural expiry, when known (used for pruning)
type Entries = HashMap<String, Option<DateTime<Utc>>>;

pub trait RevocationStore: Send + Sync {
    fn revoke(&self, token_id: &str, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    fn is_revoked(&self, token_id: &str) -> Result<bool>;

    /// Drop entries whose tokens have expired anyway. Returns how many.
    fn prune(&self, now: DateTime<Utc>) -> Result<usize>;
}

fn record(entries: &mut Entries, token_id: &str, expires_at: Option<DateTime<Utc>>) {
    let slot = entries.entry(token_id.to_string()).or_insert(expires_at);
    // Never shorten a known expiry or forget one.
    if let (Some(old), Some(new)) = (*slot, expires_at) {
        *slot = Some(old.max(new));
    } else if slot.is_none() {
        *slot = expires_at;
    }
}

fn prune_entries(entries: &mut Entries, now: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, exp| exp.map_or(true, |exp| exp > now));
    before - entries.len()
}

/// Process-local revocation set. Clones share the same set.
#[derive(Clone, Default)]
pub struct MemoryRevocationStore {
    entries: Arc<RwLock<Entries>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> CoreError {
    CoreError::StorageFailure("revocation store lock poisoned".into())
}

impl RevocationStore for MemoryRevocationStore {
    fn revoke(&self, token_id: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        record(&mut entries, token_id, expires_at);
        Ok(())
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.contains_key(token_id))
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(prune_entries(&mut entries, now))
    }
}

#[derive(Serialize, Deserialize, Default)]
struct RevocationFile {
    revoked: Entries,
}

/// Revocation set shared by every process on the machine through a JSON
/// file.
pub struct FileRevocationStore {
    path: PathBuf,
}

impl FileRevocationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<RevocationFile> {
        match persist::read_optional(&self.path)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| CoreError::StorageFailure(format!("corrupt revocation file: {e}"))),
            None => Ok(RevocationFile::default()),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut Entries) -> T) -> Result<T> {
        let _guard = FileLock::exclusive(&self.path)?;
        let mut file = self.read()?;
        let out = f(&mut file.revoked);
        persist::write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(out)
    }
}

impl RevocationStore for FileRevocationStore {
    fn revoke(&self, token_id: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.update(|entries| record(entries, token_id, expires_at))?;
        debug!(path = %self.path.display(), "revocation recorded");
        Ok(())
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool> {
        let _guard = FileLock::shared(&self.path)?;
        Ok(self.read()?.revoked.contains_key(token_id))
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        self.update(|entries| prune_entries(entries, now))
    }
}
