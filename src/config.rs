/// Runtime configuration and wiring of the core components.
///
/// Configuration is read from environment variables:
/// - `KEYVAULT_DATA_DIR` - Optional. Where record, cache and trust files live.
///   Defaults to `<local data dir>/keyvault`.
/// - `KEYVAULT_SERVICE` - Optional. Secret store service name. Defaults to `keyvault-core`.
/// - `KEYVAULT_SESSION_TTL_SECS` - Optional. Sliding session lifetime. Defaults to `900`.
/// - `KEYVAULT_HANDSHAKE_TIMEOUT_SECS` - Optional. Defaults to `30`.
/// - `KEYVAULT_TOKEN_TTL_SECS` - Optional. Defaults to `3600`.
/// - `KEYVAULT_TRUST_POLICY` - Optional. `tofu` or `registry`. Defaults to `tofu`.
/// - `KEYVAULT_MIN_PASSPHRASE_BITS` - Optional. Defaults to `40`.
/// - `KEYVAULT_SECRET_BACKEND` - Optional. `file` or `keyring`. Defaults to `file`.
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::crypto::kdf::KdfParams;
use crate::error::Result;
use crate::handshake::{TrustPolicy, TrustStore, DEFAULT_HANDSHAKE_TIMEOUT_SECS};
use crate::keys::{MasterKeyManager, PassphrasePolicy, DEFAULT_SERVICE, DEFAULT_SESSION_TTL_MINUTES};
use crate::secret_store::{FileSecretStore, SecretStore};
use crate::session::{DiskCache, SessionCache};
use crate::token::{FileRevocationStore, DEFAULT_TOKEN_TTL_SECS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Cannot determine a data directory; set KEYVAULT_DATA_DIR")]
    NoDataDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackend {
    /// One file per service under `<data_dir>/secrets`.
    File,
    /// OS credential store (needs the `os-keyring` feature).
    Keyring,
}

impl FromStr for SecretBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(SecretBackend::File),
            "keyring" if cfg!(feature = "os-keyring") => Ok(SecretBackend::Keyring),
            "keyring" => Err("built without the os-keyring feature".to_string()),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub service: String,
    pub session_ttl: Duration,
    pub handshake_timeout: Duration,
    pub token_ttl: Duration,
    pub trust_policy: TrustPolicy,
    pub min_passphrase_bits: f64,
    pub secret_backend: SecretBackend,
    /// Not read from the environment; tests lower it.
    pub kdf: KdfParams,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> std::result::Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn positive_secs(name: &str, secs: i64) -> std::result::Result<Duration, ConfigError> {
    if secs > 0 {
        Ok(Duration::seconds(secs))
    } else {
        Err(ConfigError::InvalidValue(name.to_string(), "must be positive".to_string()))
    }
}

impl CoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> std::result::Result<Self, ConfigError> {
        let data_dir = match lookup("KEYVAULT_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("keyvault"),
        };
        let service = lookup("KEYVAULT_SERVICE").unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        if service.is_empty() {
            return Err(ConfigError::InvalidValue(
                "KEYVAULT_SERVICE".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let session_ttl = positive_secs(
            "KEYVAULT_SESSION_TTL_SECS",
            parse_var(&lookup, "KEYVAULT_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_MINUTES * 60)?,
        )?;
        let handshake_timeout = positive_secs(
            "KEYVAULT_HANDSHAKE_TIMEOUT_SECS",
            parse_var(&lookup, "KEYVAULT_HANDSHAKE_TIMEOUT_SECS", DEFAULT_HANDSHAKE_TIMEOUT_SECS)?,
        )?;
        let token_ttl = positive_secs(
            "KEYVAULT_TOKEN_TTL_SECS",
            parse_var(&lookup, "KEYVAULT_TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?,
        )?;

        Ok(Self {
            data_dir,
            service,
            session_ttl,
            handshake_timeout,
            token_ttl,
            trust_policy: parse_var(&lookup, "KEYVAULT_TRUST_POLICY", TrustPolicy::TrustOnFirstUse)?,
            min_passphrase_bits: parse_var(
                &lookup,
                "KEYVAULT_MIN_PASSPHRASE_BITS",
                crate::keys::policy::DEFAULT_MIN_BITS,
            )?,
            secret_backend: parse_var(&lookup, "KEYVAULT_SECRET_BACKEND", SecretBackend::File)?,
            kdf: KdfParams::default(),
        })
    }

    /// Defaults rooted at `data_dir` (useful for testing).
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            service: DEFAULT_SERVICE.to_string(),
            session_ttl: Duration::minutes(DEFAULT_SESSION_TTL_MINUTES),
            handshake_timeout: Duration::seconds(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            token_ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            trust_policy: TrustPolicy::TrustOnFirstUse,
            min_passphrase_bits: crate::keys::policy::DEFAULT_MIN_BITS,
            secret_backend: SecretBackend::File,
            kdf: KdfParams::default(),
        }
    }

    pub fn session_cache_path(&self) -> PathBuf {
        self.data_dir.join("session.cache")
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.data_dir.join("known_peers.json")
    }

    pub fn revocation_path(&self) -> PathBuf {
        self.data_dir.join("revoked.json")
    }

    /// Secret store service holding the session cache key.
    pub fn cache_key_service(&self) -> String {
        format!("{}.session-cache", self.service)
    }

    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match self.secret_backend {
            #[cfg(feature = "os-keyring")]
            SecretBackend::Keyring => Arc::new(crate::secret_store::KeyringSecretStore::new()),
            _ => Arc::new(FileSecretStore::new(self.data_dir.join("secrets"))),
        }
    }

    pub fn session_cache(&self, secrets: Arc<dyn SecretStore>, clock: SharedClock) -> SessionCache {
        let disk = DiskCache::new(self.session_cache_path(), secrets, self.cache_key_service());
        SessionCache::with_disk(disk, clock)
    }

    /// Fully wired key manager: configured secret store, disk-backed
    /// session cache, policy and TTL.
    pub fn key_manager(&self, clock: SharedClock) -> MasterKeyManager {
        let secrets = self.secret_store();
        let cache = Arc::new(self.session_cache(secrets.clone(), clock.clone()));
        MasterKeyManager::new(secrets, cache, clock)
            .with_service(self.service.clone())
            .with_kdf_params(self.kdf)
            .with_policy(PassphrasePolicy::with_min_bits(self.min_passphrase_bits))
            .with_session_ttl(self.session_ttl)
    }

    pub fn trust_store(&self) -> Result<TrustStore> {
        TrustStore::open(self.trust_policy, self.trust_store_path())
    }

    pub fn revocation_store(&self) -> FileRevocationStore {
        FileRevocationStore::new(self.revocation_path())
    }
}
