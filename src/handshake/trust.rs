/// Pinned peer identities.
///
/// Under `TrustOnFirstUse` an unknown component is accepted once and its
/// identity key pinned; under `Registry` only pre-registered components are
/// accepted. Either way a pinned component presenting a different key is
/// rejected. Pins are written only when a handshake reaches `Established`.
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::persist::{self, FileLock};

pub type IdentityKey = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    TrustOnFirstUse,
    Registry,
}

impl FromStr for TrustPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tofu" | "trust_on_first_use" => Ok(TrustPolicy::TrustOnFirstUse),
            "registry" => Ok(TrustPolicy::Registry),
            other => Err(format!("unknown trust policy {other:?}")),
        }
    }
}

/// Outcome of a successful identity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Component is pinned to this key.
    Known,
    /// Component is unknown and policy allows pinning it.
    FirstUse,
}

#[derive(Serialize, Deserialize, Default)]
struct PinFile {
    /// component -> identity key (hex)
    pins: HashMap<String, String>,
}

pub struct TrustStore {
    policy: TrustPolicy,
    pins: RwLock<HashMap<String, IdentityKey>>,
    path: Option<PathBuf>,
}

impl TrustStore {
    pub fn in_memory(policy: TrustPolicy) -> Self {
        Self {
            policy,
            pins: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Pins persisted as JSON at `path`, loaded now and written through on
    /// every change.
    pub fn open(policy: TrustPolicy, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = {
            let _guard = FileLock::shared(&path)?;
            persist::read_optional(&path)?
        };
        let mut pins = HashMap::new();
        if let Some(raw) = raw {
            let file: PinFile = serde_json::from_slice(&raw)
                .map_err(|e| CoreError::StorageFailure(format!("corrupt trust store: {e}")))?;
            for (component, key) in file.pins {
                let key: IdentityKey = hex::decode(&key)
                    .ok()
                    .and_then(|k| k.try_into().ok())
                    .ok_or_else(|| {
                        CoreError::StorageFailure(format!("corrupt pin for {component}"))
                    })?;
                pins.insert(component, key);
            }
        }
        Ok(Self {
            policy,
            pins: RwLock::new(pins),
            path: Some(path),
        })
    }

    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    fn poisoned() -> CoreError {
        CoreError::StorageFailure("trust store lock poisoned".into())
    }

    /// Check a presented identity. Unknown-under-registry and key mismatch
    /// both fail with `AuthenticationFailed`, indistinguishable to the peer.
    pub fn check(&self, component: &str, key: &IdentityKey) -> Result<TrustDecision> {
        let pins = self.pins.read().map_err(|_| Self::poisoned())?;
        match pins.get(component) {
            Some(pinned) if crate::crypto::hash::digest_eq(pinned, key) => Ok(TrustDecision::Known),
            Some(_) => {
                warn!(component, "identity key does not match pinned key");
                Err(CoreError::AuthenticationFailed)
            }
            None if self.policy == TrustPolicy::TrustOnFirstUse => Ok(TrustDecision::FirstUse),
            None => {
                warn!(component, "unknown component rejected by registry policy");
                Err(CoreError::AuthenticationFailed)
            }
        }
    }

    /// Pin a first-use identity. Fails if another key was pinned for the
    /// component in the meantime.
    pub fn pin(&self, component: &str, key: &IdentityKey) -> Result<()> {
        let mut pins = self.pins.write().map_err(|_| Self::poisoned())?;
        match pins.get(component) {
            Some(pinned) if pinned == key => return Ok(()),
            Some(_) => return Err(CoreError::AuthenticationFailed),
            None => {}
        }
        self.commit(&mut pins, |next| {
            next.insert(component.to_string(), *key);
        })?;
        info!(component, fingerprint = %crate::crypto::hash::fingerprint(key), "pinned new peer identity");
        Ok(())
    }

    /// Explicitly register (or replace) a component's identity.
    pub fn register(&self, component: &str, key: &IdentityKey) -> Result<()> {
        let mut pins = self.pins.write().map_err(|_| Self::poisoned())?;
        self.commit(&mut pins, |next| {
            next.insert(component.to_string(), *key);
        })
    }

    pub fn forget(&self, component: &str) -> Result<bool> {
        let mut pins = self.pins.write().map_err(|_| Self::poisoned())?;
        if !pins.contains_key(component) {
            return Ok(false);
        }
        self.commit(&mut pins, |next| {
            next.remove(component);
        })?;
        Ok(true)
    }

    pub fn pinned(&self, component: &str) -> Result<Option<IdentityKey>> {
        let pins = self.pins.read().map_err(|_| Self::poisoned())?;
        Ok(pins.get(component).copied())
    }

    /// Apply `change` to a copy, write it, and only then replace the live
    /// map. A failed write leaves memory and disk as they were.
    fn commit(
        &self,
        pins: &mut HashMap<String, IdentityKey>,
        change: impl FnOnce(&mut HashMap<String, IdentityKey>),
    ) -> Result<()> {
        let mut next = pins.clone();
        change(&mut next);
        self.persist(&next)?;
        *pins = next;
        Ok(())
    }

    fn persist(&self, pins: &HashMap<String, IdentityKey>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = PinFile {
            pins: pins
                .iter()
                .map(|(c, k)| (c.clone(), hex::encode(k)))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let _guard = FileLock::exclusive(path)?;
        persist::write_atomic(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tofu_then_known() {
        let trust = TrustStore::in_memory(TrustPolicy::TrustOnFirstUse);
        assert_eq!(trust.check("cli", &[1; 32]).unwrap(), TrustDecision::FirstUse);
        trust.pin("cli", &[1; 32]).unwrap();
        assert_eq!(trust.check("cli", &[1; 32]).unwrap(), TrustDecision::Known);
        assert!(matches!(
            trust.check("cli", &[2; 32]),
            Err(CoreError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_registry_rejects_unknown() {
        let trust = TrustStore::in_memory(TrustPolicy::Registry);
        assert!(trust.check("cli", &[1; 32]).is_err());
        trust.register("cli", &[1; 32]).unwrap();
        assert_eq!(trust.check("cli", &[1; 32]).unwrap(), TrustDecision::Known);
    }

    #[test]
    fn test_pin_race_loses() {
        let trust = TrustStore::in_memory(TrustPolicy::TrustOnFirstUse);
        trust.pin("cli", &[1; 32]).unwrap();
        assert!(trust.pin("cli", &[2; 32]).is_err());
        assert!(trust.pin("cli", &[1; 32]).is_ok());
    }

    #[test]
    fn test_persisted_pins_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_peers.json");
        {
            let trust = TrustStore::open(TrustPolicy::TrustOnFirstUse, &path).unwrap();
            trust.pin("cli", &[7; 32]).unwrap();
        }
        let reopened = TrustStore::open(TrustPolicy::Registry, &path).unwrap();
        assert_eq!(reopened.pinned("cli").unwrap(), Some([7; 32]));
        assert!(reopened.forget("cli").unwrap());
        assert!(reopened.check("cli", &[7; 32]).is_err());
    }

    #[test]
    fn test_failed_write_leaves_no_pin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_peers.json");
        let trust = TrustStore::open(TrustPolicy::TrustOnFirstUse, &path).unwrap();
        trust.register("server", &[1; 32]).unwrap();

        // A directory in place of the file makes the atomic rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(
            trust.pin("cli", &[7; 32]),
            Err(CoreError::StorageFailure(_))
        ));
        assert_eq!(trust.pinned("cli").unwrap(), None);
        assert_eq!(trust.check("cli", &[8; 32]).unwrap(), TrustDecision::FirstUse);

        assert!(trust.register("other", &[2; 32]).is_err());
        assert_eq!(trust.pinned("other").unwrap(), None);
        assert!(trust.forget("server").is_err());
        assert_eq!(trust.pinned("server").unwrap(), Some([1; 32]));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("tofu".parse::<TrustPolicy>().unwrap(), TrustPolicy::TrustOnFirstUse);
        assert_eq!("Registry".parse::<TrustPolicy>().unwrap(), TrustPolicy::Registry);
        assert!("open".parse::<TrustPolicy>().is_err());
    }
}
