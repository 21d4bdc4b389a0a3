/// Secret Store Adapter: where the wrapped master secret lives.
///
/// The key manager only needs three capabilities, keyed by a service name:
/// store, retrieve and delete opaque bytes. Backends:
/// - `MemorySecretStore`: process-local, for tests and embedding
/// - `FileSecretStore`: one owner-only file per service in the data directory
/// - `KeyringSecretStore`: the OS credential store (feature `os-keyring`)
pub mod file;
#[cfg(feature = "os-keyring")]
pub mod keyring;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CoreError, Result};

pub use file::FileSecretStore;
#[cfg(feature = "os-keyring")]
pub use self::keyring::KeyringSecretStore;

/// Capability interface over an OS-provided (or emulated) credential store.
///
/// Implementations must be safe to share between threads. Every backend
/// failure maps to `CoreError::StorageFailure`.
pub trait SecretStore: Send + Sync {
    /// Store or replace the bytes for `service`.
    fn store(&self, service: &str, secret: &[u8]) -> Result<()>;

    /// Store the bytes only if nothing is stored for `service` yet.
    /// Returns `false`, leaving the existing entry untouched, otherwise.
    fn store_if_absent(&self, service: &str, secret: &[u8]) -> Result<bool>;

    /// Fetch the bytes for `service`, `None` if nothing is stored.
    fn retrieve(&self, service: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the bytes for `service`. Succeeds if nothing was stored.
    fn delete(&self, service: &str) -> Result<()>;
}

/// In-memory store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn store(&self, service: &str, secret: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::StorageFailure("secret store lock poisoned".into()))?;
        entries.insert(service.to_string(), secret.to_vec());
        Ok(())
    }

    fn store_if_absent(&self, service: &str, secret: &[u8]) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::StorageFailure("secret store lock poisoned".into()))?;
        match entries.entry(service.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(secret.to_vec());
                Ok(true)
            }
        }
    }

    fn retrieve(&self, service: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CoreError::StorageFailure("secret store lock poisoned".into()))?;
        Ok(entries.get(service).cloned())
    }

    fn delete(&self, service: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::StorageFailure("secret store lock poisoned".into()))?;
        if let Some(mut old) = entries.remove(service) {
            zeroize::Zeroize::zeroize(&mut old);
        }
        Ok(())
    }
}

impl<T: SecretStore + ?Sized> SecretStore for Arc<T> {
    fn store(&self, service: &str, secret: &[u8]) -> Result<()> {
        (**self).store(service, secret)
    }

    fn store_if_absent(&self, service: &str, secret: &[u8]) -> Result<bool> {
        (**self).store_if_absent(service, secret)
    }

    fn retrieve(&self, service: &str) -> Result<Option<Vec<u8>>> {
        (**self).retrieve(service)
    }

    fn delete(&self, service: &str) -> Result<()> {
        (**self).delete(service)
    }
}
