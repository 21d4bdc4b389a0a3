/// Session cache: keeps the unlocked master secret alive across short-lived
/// process invocations with a sliding expiry.
///
/// Two layers:
/// - memory, for the current process
/// - an encrypted file (`disk`), so a second CLI invocation within the TTL
///   resumes the session without prompting
///
/// When the disk layer is configured it is the source of truth: every read
/// reloads it, so a `lock` in one process is seen by all others. Expiry is
/// lazy: entries are checked and dropped on read, never swept.
pub mod disk;

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub use disk::DiskCache;

/// An unlocked key plus its sliding lifetime.
#[derive(Clone)]
pub struct SessionCacheEntry {
    unlocked_key: SensitiveBytes32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl SessionCacheEntry {
    pub fn unlocked_key(&self) -> &SensitiveBytes32 {
        &self.unlocked_key
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_accessed_at + self.ttl
    }

    /// Valid while `now <= last_accessed_at + ttl`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at()
    }
}

impl std::fmt::Debug for SessionCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCacheEntry")
            .field("created_at", &self.created_at)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Read-only diagnostic view of the session. Never carries key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Whole seconds left before expiry.
    pub remaining_ttl_secs: Option<i64>,
}

impl SessionInfo {
    fn inactive() -> Self {
        Self {
            active: false,
            created_at: None,
            last_accessed_at: None,
            remaining_ttl_secs: None,
        }
    }
}

#[derive(Default)]
struct CacheState {
    entry: Option<SessionCacheEntry>,
    /// Set when the disk layer failed a write; the session then lives in
    /// memory only until the next `invalidate` or successful `write`.
    disk_degraded: bool,
}

pub struct SessionCache {
    state: Mutex<CacheState>,
    disk: Option<DiskCache>,
    clock: SharedClock,
}

impl SessionCache {
    /// Memory-only cache; sessions end with the process.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            disk: None,
            clock,
        }
    }

    /// Memory cache backed by an encrypted file shared across processes.
    pub fn with_disk(disk: DiskCache, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            disk: Some(disk),
            clock,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| CoreError::StorageFailure("session cache lock poisoned".into()))
    }

    fn active_disk(&self, state: &CacheState) -> Option<&DiskCache> {
        if state.disk_degraded {
            None
        } else {
            self.disk.as_ref()
        }
    }

    /// Refresh the memory layer from disk. On a disk error a still-valid
    /// memory entry keeps the session usable; otherwise the error surfaces.
    fn sync_from_disk(&self, state: &mut CacheState) -> Result<()> {
        let Some(disk) = self.active_disk(state) else {
            return Ok(());
        };
        match disk.load() {
            Ok(loaded) => {
                state.entry = loaded;
                Ok(())
            }
            Err(e) if state.entry.is_some() => {
                warn!(error = %e, "session cache file unreadable, using in-memory entry");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current entry if still valid; an expired entry is removed.
    /// Does not extend the session.
    pub fn read(&self) -> Result<Option<SessionCacheEntry>> {
        let now = self.clock.now();
        let mut state = self.state()?;
        self.sync_from_disk(&mut state)?;

        match state.entry.as_ref() {
            Some(entry) if entry.is_valid_at(now) => Ok(Some(entry.clone())),
            Some(entry) => {
                debug!(expired_at = %entry.expires_at(), "session expired");
                // Re-checked under the file lock: another process may have
                // started a fresh session since the load.
                let current = match self.active_disk(&state) {
                    Some(disk) => disk.update(|cur| cur.filter(|e| e.is_valid_at(now)))?,
                    None => None,
                };
                state.entry = current.clone();
                Ok(current)
            }
            None => Ok(None),
        }
    }

    /// Start a new session, replacing any previous one.
    ///
    /// If the disk layer cannot be written the session is kept in memory
    /// for this process and the error is returned for the caller to report.
    pub fn write(&self, unlocked_key: SensitiveBytes32, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let entry = SessionCacheEntry {
            unlocked_key,
            created_at: now,
            last_accessed_at: now,
            ttl,
        };
        let mut state = self.state()?;
        let saved = match &self.disk {
            Some(disk) => disk.save(&entry),
            None => Ok(()),
        };
        state.disk_degraded = saved.is_err();
        state.entry = Some(entry);
        debug!(ttl_secs = ttl.num_seconds(), "session started");
        saved
    }

    /// Slide the expiry of a live session. Returns whether a session was
    /// extended; an expired entry is removed instead.
    pub fn touch(&self) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state()?;

        if let Some(disk) = self.active_disk(&state) {
            let next = disk.update(|current| {
                current.filter(|e| e.is_valid_at(now)).map(|mut e| {
                    e.last_accessed_at = now;
                    e
                })
            })?;
            state.entry = next;
            return Ok(state.entry.is_some());
        }

        match state.entry.as_mut() {
            Some(entry) if entry.is_valid_at(now) => {
                entry.last_accessed_at = now;
                Ok(true)
            }
            _ => {
                state.entry = None;
                Ok(false)
            }
        }
    }

    /// End the session unconditionally. The in-memory key is zeroized as it
    /// is dropped.
    pub fn invalidate(&self) -> Result<()> {
        let mut state = self.state()?;
        state.entry = None;
        state.disk_degraded = false;
        if let Some(disk) = &self.disk {
            disk.remove()?;
        }
        debug!("session invalidated");
        Ok(())
    }

    /// Diagnostic snapshot without touching the session.
    pub fn info(&self) -> Result<SessionInfo> {
        let now = self.clock.now();
        Ok(match self.read()? {
            Some(entry) => SessionInfo {
                active: true,
                created_at: Some(entry.created_at),
                last_accessed_at: Some(entry.last_accessed_at),
                remaining_ttl_secs: Some((entry.expires_at() - now).num_seconds().max(0)),
            },
            None => SessionInfo::inactive(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::secret_store::{MemorySecretStore, SecretStore};

    fn key() -> SensitiveBytes32 {
        SensitiveBytes32::new([3; 32])
    }

    #[test]
    fn test_readable_until_ttl_then_absent() {
        let clock = ManualClock::default();
        let cache = SessionCache::in_memory(Arc::new(clock.clone()));
        cache.write(key(), Duration::minutes(15)).unwrap();

        clock.advance(Duration::minutes(15) - Duration::seconds(1));
        assert!(cache.read().unwrap().is_some());

        clock.advance(Duration::seconds(2));
        assert!(cache.read().unwrap().is_none());
        // Removed, not just hidden.
        clock.set(clock.now() - Duration::minutes(10));
        assert!(cache.read().unwrap().is_none());
    }

    #[test]
    fn test_touch_slides_expiry() {
        let clock = ManualClock::default();
        let cache = SessionCache::in_memory(Arc::new(clock.clone()));
        cache.write(key(), Duration::minutes(15)).unwrap();

        clock.advance(Duration::minutes(10));
        assert!(cache.touch().unwrap());
        clock.advance(Duration::minutes(10));
        let entry = cache.read().unwrap().unwrap();
        assert!(entry.unlocked_key().ct_eq(&key()));
        assert!(entry.created_at < entry.last_accessed_at);
    }

    #[test]
    fn test_touch_does_not_revive_expired() {
        let clock = ManualClock::default();
        let cache = SessionCache::in_memory(Arc::new(clock.clone()));
        cache.write(key(), Duration::minutes(1)).unwrap();
        clock.advance(Duration::minutes(2));
        assert!(!cache.touch().unwrap());
        assert!(cache.read().unwrap().is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = SessionCache::in_memory(Arc::new(ManualClock::default()));
        cache.write(key(), Duration::minutes(15)).unwrap();
        cache.invalidate().unwrap();
        assert!(cache.read().unwrap().is_none());
        assert!(!cache.info().unwrap().active);
    }

    #[test]
    fn test_info_reports_remaining() {
        let clock = ManualClock::default();
        let cache = SessionCache::in_memory(Arc::new(clock.clone()));
        cache.write(key(), Duration::minutes(15)).unwrap();
        clock.advance(Duration::minutes(5));
        let info = cache.info().unwrap();
        assert!(info.active);
        assert_eq!(info.remaining_ttl_secs, Some(600));
        // info is read-only
        assert_eq!(info.last_accessed_at, info.created_at);
    }

    #[test]
    fn test_second_process_resumes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let clock = ManualClock::default();
        let path = dir.path().join("session.cache");

        let first = SessionCache::with_disk(
            DiskCache::new(&path, secrets.clone(), "svc.session-cache"),
            Arc::new(clock.clone()),
        );
        first.write(key(), Duration::minutes(15)).unwrap();

        let second = SessionCache::with_disk(
            DiskCache::new(&path, secrets.clone(), "svc.session-cache"),
            Arc::new(clock.clone()),
        );
        clock.advance(Duration::minutes(10));
        assert!(second.touch().unwrap());
        clock.advance(Duration::minutes(10));

        // The first process sees the extension made by the second.
        assert!(first.read().unwrap().is_some());

        second.invalidate().unwrap();
        assert!(first.read().unwrap().is_none());
    }

    #[test]
    fn test_expired_read_keeps_session_started_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let path = dir.path().join("session.cache");
        let clock = ManualClock::default();

        let stale = SessionCache::with_disk(
            DiskCache::new(&path, secrets.clone(), "svc.session-cache"),
            Arc::new(clock.clone()),
        );
        stale.write(key(), Duration::minutes(1)).unwrap();
        clock.advance(Duration::minutes(2));
        assert!(stale.read().unwrap().is_none());
        assert!(!path.exists());

        let fresh = SessionCache::with_disk(
            DiskCache::new(&path, secrets.clone(), "svc.session-cache"),
            Arc::new(clock.clone()),
        );
        fresh.write(key(), Duration::minutes(15)).unwrap();
        // The handle that last saw an expired entry does not delete it.
        assert!(stale.read().unwrap().is_some());
        assert!(fresh.read().unwrap().is_some());
    }

    #[test]
    fn test_unwritable_disk_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the cache file should be makes every write fail.
        let path = dir.path().join("session.cache");
        std::fs::create_dir(&path).unwrap();
        let clock = ManualClock::default();
        let cache = SessionCache::with_disk(
            DiskCache::new(&path, Arc::new(MemorySecretStore::new()), "svc.session-cache"),
            Arc::new(clock.clone()),
        );

        assert!(cache.write(key(), Duration::minutes(15)).is_err());
        assert!(cache.read().unwrap().is_some());
        assert!(cache.touch().unwrap());
        cache.invalidate().ok();
        assert!(cache.state().unwrap().entry.is_none());
    }
}
