/// File-backed secret store.
///
/// Each service name maps to `<dir>/<service>.secret`, written atomically
/// with owner-only permissions. This is the fallback when no OS credential
/// store is available; the master secret inside is still wrapped under the
/// passphrase-derived key.
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::persist::{self, FileLock};

use super::SecretStore;

#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, service: &str) -> Result<PathBuf> {
        let valid = !service.is_empty()
            && service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !service.starts_with('.');
        if !valid {
            return Err(CoreError::StorageFailure(format!(
                "invalid service name: {service:?}"
            )));
        }
        Ok(self.dir.join(format!("{service}.secret")))
    }
}

impl SecretStore for FileSecretStore {
    fn store(&self, service: &str, secret: &[u8]) -> Result<()> {
        let path = self.path_for(service)?;
        let _guard = FileLock::exclusive(&path)?;
        persist::write_atomic(&path, secret)?;
        tracing::debug!(service, "secret stored");
        Ok(())
    }

    fn store_if_absent(&self, service: &str, secret: &[u8]) -> Result<bool> {
        let path = self.path_for(service)?;
        let _guard = FileLock::exclusive(&path)?;
        if persist::read_optional(&path)?.is_some() {
            return Ok(false);
        }
        persist::write_atomic(&path, secret)?;
        tracing::debug!(service, "secret created");
        Ok(true)
    }

    fn retrieve(&self, service: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(service)?;
        let _guard = FileLock::shared(&path)?;
        persist::read_optional(&path)
    }

    fn delete(&self, service: &str) -> Result<()> {
        let path = self.path_for(service)?;
        let _guard = FileLock::exclusive(&path)?;
        persist::remove_if_exists(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());

        assert!(store.retrieve("keyvault-core").unwrap().is_none());
        store.store("keyvault-core", b"wrapped-record").unwrap();
        assert_eq!(
            store.retrieve("keyvault-core").unwrap().unwrap(),
            b"wrapped-record"
        );
        store.delete("keyvault-core").unwrap();
        assert!(store.retrieve("keyvault-core").unwrap().is_none());
    }

    #[test]
    fn test_second_instance_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        FileSecretStore::new(dir.path())
            .store("svc.session-cache", b"k")
            .unwrap();
        let other = FileSecretStore::new(dir.path());
        assert_eq!(other.retrieve("svc.session-cache").unwrap().unwrap(), b"k");
    }

    #[test]
    fn test_store_if_absent_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = std::sync::Barrier::new(4);
        let created: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4u8)
                .map(|i| {
                    let store = FileSecretStore::new(dir.path());
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        store.store_if_absent("svc", &[i; 8]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(created, 1);
        let stored = FileSecretStore::new(dir.path()).retrieve("svc").unwrap().unwrap();
        assert_eq!(stored.len(), 8);
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());
        assert!(matches!(
            store.store("../escape", b"x"),
            Err(CoreError::StorageFailure(_))
        ));
        assert!(store.retrieve("").is_err());
    }
}
