/// Encrypted on-disk layer of the session cache.
///
/// The unlocked key is sealed with XChaCha20-Poly1305 under a per-installation
/// cache key kept in the secret store, so the cache file alone does not
/// reveal the key. The entry timestamps travel in the clear but are bound
/// as AAD: editing them breaks the tag and the entry is destroyed on the
/// next read.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::aead;
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};
use crate::persist::{self, FileLock};
use crate::secret_store::SecretStore;

use super::SessionCacheEntry;

const ENVELOPE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    version: u32,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    ttl_secs: i64,
    /// XChaCha20 nonce (hex).
    nonce: String,
    /// Sealed unlocked key (hex).
    ciphertext: String,
}

fn envelope_aad(
    version: u32,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    ttl_secs: i64,
) -> Vec<u8> {
    format!(
        "keyvault-session-cache|v{version}|{}|{}|{ttl_secs}",
        created_at.timestamp_micros(),
        last_accessed_at.timestamp_micros()
    )
    .into_bytes()
}

pub struct DiskCache {
    path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    key_service: String,
}

impl DiskCache {
    pub fn new(path: impl Into<PathBuf>, secrets: Arc<dyn SecretStore>, key_service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            secrets,
            key_service: key_service.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn existing_key(&self) -> Result<Option<SensitiveBytes32>> {
        match self.secrets.retrieve(&self.key_service)? {
            Some(bytes) => SensitiveBytes32::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| CoreError::StorageFailure("session cache key has wrong length".into())),
            None => Ok(None),
        }
    }

    fn key_or_create(&self) -> Result<SensitiveBytes32> {
        if let Some(key) = self.existing_key()? {
            return Ok(key);
        }
        let key = SensitiveBytes32::random();
        if self.secrets.store_if_absent(&self.key_service, key.as_bytes())? {
            debug!("created session cache key");
            return Ok(key);
        }
        // Lost the race to another process; use its key.
        self.existing_key()?
            .ok_or_else(|| CoreError::StorageFailure("session cache key vanished".into()))
    }

    fn seal(&self, entry: &SessionCacheEntry) -> Result<Vec<u8>> {
        let key = self.key_or_create()?;
        let ttl_secs = entry.ttl.num_seconds();
        let aad = envelope_aad(ENVELOPE_VERSION, entry.created_at, entry.last_accessed_at, ttl_secs);
        let (nonce, ciphertext) = aead::encrypt(&key, entry.unlocked_key().as_bytes(), &aad)?;
        let envelope = CacheEnvelope {
            version: ENVELOPE_VERSION,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            ttl_secs,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// `Ok(None)` for both "absent" and "unreadable"; `load` deletes an
    /// unreadable file.
    fn open(&self, bytes: &[u8]) -> Result<Option<SessionCacheEntry>> {
        let envelope: CacheEnvelope = match serde_json::from_slice(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "session cache file is corrupt");
                return Ok(None);
            }
        };
        if envelope.version != ENVELOPE_VERSION {
            warn!(version = envelope.version, "unsupported session cache version");
            return Ok(None);
        }
        let Some(key) = self.existing_key()? else {
            warn!("session cache present but its key is missing");
            return Ok(None);
        };
        let opened = aead::nonce_from_hex(&envelope.nonce).and_then(|nonce| {
            let ciphertext = hex::decode(&envelope.ciphertext)
                .map_err(|e| CoreError::Malformed(e.to_string()))?;
            let aad = envelope_aad(
                envelope.version,
                envelope.created_at,
                envelope.last_accessed_at,
                envelope.ttl_secs,
            );
            aead::decrypt(&key, &nonce, &ciphertext, &aad)
        });
        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(_) => {
                warn!("session cache failed authentication, discarding");
                return Ok(None);
            }
        };
        let unlocked_key = SensitiveBytes32::from_slice(plaintext.as_bytes())
            .ok_or_else(|| CoreError::StorageFailure("session cache key length".into()))?;
        Ok(Some(SessionCacheEntry {
            unlocked_key,
            created_at: envelope.created_at,
            last_accessed_at: envelope.last_accessed_at,
            ttl: Duration::seconds(envelope.ttl_secs),
        }))
    }

    /// Load the current entry. Tampered or unreadable files are removed.
    pub fn load(&self) -> Result<Option<SessionCacheEntry>> {
        let bytes = {
            let _guard = FileLock::shared(&self.path)?;
            persist::read_optional(&self.path)?
        };
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        match self.open(&bytes)? {
            Some(entry) => Ok(Some(entry)),
            None => self.discard_if_unchanged(&bytes),
        }
    }

    /// Remove the file only if it still holds `seen`. A file replaced since
    /// it was read belongs to another writer and is opened instead.
    fn discard_if_unchanged(&self, seen: &[u8]) -> Result<Option<SessionCacheEntry>> {
        let _guard = FileLock::exclusive(&self.path)?;
        match persist::read_optional(&self.path)? {
            Some(current) if current == seen => {
                persist::remove_if_exists(&self.path)?;
                Ok(None)
            }
            Some(current) => self.open(&current),
            None => Ok(None),
        }
    }

    pub fn save(&self, entry: &SessionCacheEntry) -> Result<()> {
        let sealed = self.seal(entry)?;
        let _guard = FileLock::exclusive(&self.path)?;
        persist::write_atomic(&self.path, &sealed)
    }

    /// Read-modify-write under one exclusive lock, so an `invalidate` from
    /// another process cannot be undone by a concurrent `touch`.
    pub fn update<F>(&self, f: F) -> Result<Option<SessionCacheEntry>>
    where
        F: FnOnce(Option<SessionCacheEntry>) -> Option<SessionCacheEntry>,
    {
        let _guard = FileLock::exclusive(&self.path)?;
        let current = match persist::read_optional(&self.path)? {
            Some(bytes) => self.open(&bytes)?,
            None => None,
        };
        let next = f(current);
        match &next {
            Some(entry) => persist::write_atomic(&self.path, &self.seal(entry)?)?,
            None => persist::remove_if_exists(&self.path)?,
        }
        Ok(next)
    }

    pub fn remove(&self) -> Result<()> {
        let _guard = FileLock::exclusive(&self.path)?;
        persist::remove_if_exists(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::MemorySecretStore;

    fn disk(dir: &Path, secrets: Arc<dyn SecretStore>) -> DiskCache {
        DiskCache::new(dir.join("session.cache"), secrets, "test.session-cache")
    }

    fn entry() -> SessionCacheEntry {
        let now = Utc::now();
        SessionCacheEntry {
            unlocked_key: SensitiveBytes32::new([5; 32]),
            created_at: now,
            last_accessed_at: now,
            ttl: Duration::minutes(15),
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        assert!(cache.load().unwrap().is_none());

        let original = entry();
        cache.save(&original).unwrap();
        let loaded = cache.load().unwrap().unwrap();
        assert!(loaded.unlocked_key().ct_eq(original.unlocked_key()));
        assert_eq!(loaded.created_at, original.created_at);
        assert_eq!(loaded.ttl, original.ttl);
    }

    #[test]
    fn test_file_does_not_contain_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        cache.save(&entry()).unwrap();
        let raw = std::fs::read_to_string(cache.path()).unwrap();
        assert!(!raw.contains(&hex::encode([5u8; 32])));
    }

    #[test]
    fn test_tampered_timestamp_destroys_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        cache.save(&entry()).unwrap();

        let raw = std::fs::read(cache.path()).unwrap();
        let mut envelope: CacheEnvelope = serde_json::from_slice(&raw).unwrap();
        envelope.last_accessed_at = envelope.last_accessed_at + Duration::days(1);
        std::fs::write(cache.path(), serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(cache.load().unwrap().is_none());
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_copied_file_unreadable_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        cache.save(&entry()).unwrap();

        // Same file, different host: the cache key is not in this store.
        let foreign = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        assert!(foreign.load().unwrap().is_none());
    }

    #[test]
    fn test_garbage_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        std::fs::write(cache.path(), b"{not json").unwrap();
        assert!(cache.load().unwrap().is_none());
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_discard_spares_file_rewritten_by_another_writer() {
        let dir = tempfile::tempdir().unwrap();
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let reader = disk(dir.path(), secrets.clone());
        let writer = disk(dir.path(), secrets);

        std::fs::write(reader.path(), b"{not json").unwrap();
        let seen = std::fs::read(reader.path()).unwrap();

        // Between this reader's read and its cleanup, another handle saves.
        let fresh = entry();
        writer.save(&fresh).unwrap();

        let kept = reader.discard_if_unchanged(&seen).unwrap().unwrap();
        assert!(kept.unlocked_key().ct_eq(fresh.unlocked_key()));
        assert!(reader.path().exists());

        // Unchanged garbage is still removed.
        std::fs::write(reader.path(), b"{not json").unwrap();
        assert!(reader.discard_if_unchanged(&seen).unwrap().is_none());
        assert!(!reader.path().exists());
    }

    #[test]
    fn test_two_handles_agree_on_cache_key() {
        let dir = tempfile::tempdir().unwrap();
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let a = disk(dir.path(), secrets.clone());
        let b = disk(dir.path(), secrets);
        let ka = a.key_or_create().unwrap();
        let kb = b.key_or_create().unwrap();
        assert!(ka.ct_eq(&kb));
    }

    #[test]
    fn test_update_removes_when_closure_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk(dir.path(), Arc::new(MemorySecretStore::new()));
        cache.save(&entry()).unwrap();
        assert!(cache.update(|_| None).unwrap().is_none());
        assert!(cache.load().unwrap().is_none());
    }
}
