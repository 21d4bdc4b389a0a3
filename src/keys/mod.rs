/// Master Key Manager: lifecycle of the installation's single master secret
/// and derivation of per-store keys from it.
///
/// - `setup`: generate the secret, wrap it under the passphrase, store it
/// - `unlock`: session cache first, passphrase (Argon2id) on a miss
/// - `lock`: end the session and drop the in-memory key
/// - `derive`: cheap HKDF per purpose, only while unlocked
///
/// Unlock and derive are split so the expensive interactive step happens
/// at most once per session window while storage engines derive on every
/// open.
pub mod context;
pub mod policy;
pub mod record;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::SharedClock;
use crate::crypto::hash;
use crate::crypto::kdf::KdfParams;
use crate::crypto::sensitive::SensitiveBytes32;
use crate::crypto::sign::IdentityKeyPair;
use crate::error::{CoreError, Result};
use crate::secret_store::SecretStore;
use crate::session::{SessionCache, SessionInfo};

pub use context::{DerivedKeyContext, StoreKind, IDENTITY_PURPOSE_PREFIX, TOKEN_SIGNING_PURPOSE};
pub use policy::PassphrasePolicy;
pub use record::KeyStoreRecord;

pub const DEFAULT_SERVICE: &str = "keyvault-core";
pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 15;

/// The unlocked root secret. Opaque: callers derive from it or fingerprint
/// it, but cannot print it.
#[derive(Clone)]
pub struct MasterSecret(SensitiveBytes32);

fn reject_reserved(purpose: &str) -> Result<()> {
    if context::is_reserved_purpose(purpose) {
        return Err(CoreError::Malformed(format!(
            "derivation purpose {purpose:?} is reserved"
        )));
    }
    Ok(())
}

impl MasterSecret {
    pub fn derive(&self, purpose: &str) -> Result<DerivedKeyContext> {
        reject_reserved(purpose)?;
        DerivedKeyContext::derive(&self.0, purpose)
    }

    /// Public identifier of this secret, safe to log.
    pub fn fingerprint(&self) -> String {
        hash::fingerprint(&hash::check_value(self.0.as_bytes()))
    }

    pub(crate) fn expose(&self) -> &SensitiveBytes32 {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterSecret({})", self.fingerprint())
    }
}

pub struct MasterKeyManager {
    secrets: Arc<dyn SecretStore>,
    cache: Arc<SessionCache>,
    clock: SharedClock,
    service: String,
    kdf: KdfParams,
    policy: PassphrasePolicy,
    session_ttl: Duration,
    setup_lock: Mutex<()>,
}

impl MasterKeyManager {
    pub fn new(secrets: Arc<dyn SecretStore>, cache: Arc<SessionCache>, clock: SharedClock) -> Self {
        Self {
            secrets,
            cache,
            clock,
            service: DEFAULT_SERVICE.to_string(),
            kdf: KdfParams::default(),
            policy: PassphrasePolicy::default(),
            session_ttl: Duration::minutes(DEFAULT_SESSION_TTL_MINUTES),
            setup_lock: Mutex::new(()),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_policy(mut self, policy: PassphrasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    fn load_record(&self) -> Result<Option<KeyStoreRecord>> {
        self.secrets
            .retrieve(&self.service)?
            .map(|bytes| KeyStoreRecord::from_bytes(&bytes))
            .transpose()
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.secrets.retrieve(&self.service)?.is_some())
    }

    /// Create the installation's master secret.
    ///
    /// Does not start a session; the first `unlock` needs the passphrase.
    pub fn setup(&self, passphrase: &str) -> Result<MasterSecret> {
        let _guard = self
            .setup_lock
            .lock()
            .map_err(|_| CoreError::StorageFailure("setup lock poisoned".into()))?;

        if self.is_initialized()? {
            return Err(CoreError::AlreadyInitialized);
        }
        self.policy.check(passphrase)?;

        let master = SensitiveBytes32::random();
        let record = KeyStoreRecord::wrap(&master, passphrase, self.kdf, self.clock.now())?;
        // Another manager may have finished setup while this one was wrapping.
        if !self.secrets.store_if_absent(&self.service, &record.to_bytes()?)? {
            return Err(CoreError::AlreadyInitialized);
        }

        let master = MasterSecret(master);
        info!(service = %self.service, fingerprint = %master.fingerprint(), "master secret created");
        Ok(master)
    }

    /// Unlock, preferring a live session over the passphrase.
    ///
    /// A usable cache entry is returned (and its expiry slid) without looking
    /// at `passphrase`. On a miss the passphrase is required: `None` yields
    /// `InteractionRequired`.
    pub fn unlock(&self, passphrase: Option<&str>) -> Result<MasterSecret> {
        match self.cache.read() {
            Ok(Some(entry)) => {
                if let Err(e) = self.cache.touch() {
                    warn!(error = %e, "could not extend session");
                }
                debug!("unlocked from session cache");
                return Ok(MasterSecret(entry.unlocked_key().clone()));
            }
            Ok(None) => debug!("session cache miss"),
            Err(e) => warn!(error = %e, "session cache unavailable, passphrase required"),
        }

        let record = self.load_record()?.ok_or(CoreError::NotInitialized)?;
        let passphrase = passphrase.ok_or(CoreError::InteractionRequired)?;

        let master = match record.unwrap_secret(passphrase) {
            Ok(master) => master,
            Err(CoreError::InvalidPassphrase) => {
                warn!(service = %self.service, "unlock rejected: invalid passphrase");
                return Err(CoreError::InvalidPassphrase);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.cache.write(master.clone(), self.session_ttl) {
            warn!(error = %e, "could not persist session");
        }
        let master = MasterSecret(master);
        info!(fingerprint = %master.fingerprint(), ttl_secs = self.session_ttl.num_seconds(), "unlocked");
        Ok(master)
    }

    /// `unlock` with the Argon2id step on the blocking thread pool, for
    /// callers on an async runtime.
    pub async fn unlock_async(self: &Arc<Self>, passphrase: Option<String>) -> Result<MasterSecret> {
        let this = Arc::clone(self);
        let passphrase = passphrase.map(Zeroizing::new);
        tokio::task::spawn_blocking(move || this.unlock(passphrase.as_deref().map(String::as_str)))
            .await
            .map_err(|e| CoreError::Crypto(format!("unlock task failed: {e}")))?
    }

    /// End the session. Subsequent unlocks need the passphrase.
    pub fn lock(&self) -> Result<()> {
        self.cache.invalidate()?;
        info!("locked");
        Ok(())
    }

    /// Key for `purpose`, e.g. `"libsql:/data/app.db"`. Extends the session.
    ///
    /// The token signing and component identity purposes are reserved and
    /// answer `Malformed`; use `component_identity` or `TokenService`.
    pub fn derive(&self, purpose: &str) -> Result<DerivedKeyContext> {
        reject_reserved(purpose)?;
        self.derive_any(purpose)
    }

    fn derive_any(&self, purpose: &str) -> Result<DerivedKeyContext> {
        let entry = self.cache.read()?.ok_or(CoreError::Locked)?;
        if let Err(e) = self.cache.touch() {
            warn!(error = %e, "could not extend session");
        }
        DerivedKeyContext::derive(entry.unlocked_key(), purpose)
    }

    /// Key for a storage engine, keyed by store kind and canonical path.
    pub fn derive_for_store(&self, kind: &StoreKind, path: &Path) -> Result<DerivedKeyContext> {
        let purpose = context::store_purpose(kind, path)?;
        self.derive(&purpose)
    }

    /// Identity key pair for a local component, stable for the life of the
    /// master secret.
    pub fn component_identity(&self, component: &str) -> Result<IdentityKeyPair> {
        let seed = self.derive_any(&format!("{IDENTITY_PURPOSE_PREFIX}{component}"))?;
        Ok(IdentityKeyPair::from_seed(seed.key()))
    }

    pub(crate) fn token_signing_key(&self) -> Result<DerivedKeyContext> {
        self.derive_any(TOKEN_SIGNING_PURPOSE)
    }

    /// Re-wrap the same master secret under a new passphrase. Derived keys
    /// are unchanged; the session is left as it is.
    pub fn rotate_passphrase(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self
            .setup_lock
            .lock()
            .map_err(|_| CoreError::StorageFailure("setup lock poisoned".into()))?;

        let record = self.load_record()?.ok_or(CoreError::NotInitialized)?;
        self.policy.check(new)?;
        let master = record.unwrap_secret(old)?;

        let mut rewrapped = KeyStoreRecord::wrap(&master, new, self.kdf, record.created_at)?;
        rewrapped.rewrapped_at = Some(self.clock.now());
        self.secrets.store(&self.service, &rewrapped.to_bytes()?)?;
        info!(service = %self.service, "passphrase rotated");
        Ok(())
    }

    /// Read-only session diagnostics. Never extends the session.
    pub fn session_info(&self) -> Result<SessionInfo> {
        self.cache.info()
    }
}
