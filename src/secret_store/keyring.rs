/// OS credential store backend using the `keyring` crate.
///
/// - Linux: Secret Service (gnome-keyring / KWallet)
/// - macOS: Keychain
/// - Windows: Credential Manager
///
/// Bytes are stored base64-encoded as the entry's password.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{CoreError, Result};

use super::SecretStore;

/// Account name under which every service entry is filed.
const ACCOUNT: &str = "master";

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringSecretStore;

impl KeyringSecretStore {
    pub const fn new() -> Self {
        Self
    }

    fn entry(service: &str) -> Result<::keyring::Entry> {
        ::keyring::Entry::new(service, ACCOUNT)
            .map_err(|e| CoreError::StorageFailure(format!("keyring entry: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn store(&self, service: &str, secret: &[u8]) -> Result<()> {
        Self::entry(service)?
            .set_password(&BASE64.encode(secret))
            .map_err(|e| CoreError::StorageFailure(format!("keyring write: {e}")))
    }

    /// The credential store has no create-only write, so this is a read
    /// followed by a write. Concurrent setups against the keyring backend
    /// are only serialized within one manager.
    fn store_if_absent(&self, service: &str, secret: &[u8]) -> Result<bool> {
        if self.retrieve(service)?.is_some() {
            return Ok(false);
        }
        self.store(service, secret)?;
        Ok(true)
    }

    fn retrieve(&self, service: &str) -> Result<Option<Vec<u8>>> {
        match Self::entry(service)?.get_password() {
            Ok(encoded) => BASE64
                .decode(encoded)
                .map(Some)
                .map_err(|e| CoreError::StorageFailure(format!("corrupted keyring entry: {e}"))),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CoreError::StorageFailure(format!("keyring read: {e}"))),
        }
    }

    fn delete(&self, service: &str) -> Result<()> {
        match Self::entry(service)?.delete_credential() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CoreError::StorageFailure(format!("keyring delete: {e}"))),
        }
    }
}
