/// Per-store keys derived from the master secret.
///
/// A purpose string names the consumer, `"<store_kind>:<canonical_path>"`,
/// e.g. `"libsql:/data/app.db"`. Storage engines ask once at connection open
/// and treat the result as an opaque symmetric key.
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::crypto::hkdf;
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

/// HKDF salt; fixes the derivation to this use.
const DERIVE_SALT: &[u8] = b"keyvault-core/derived-key/v1";

/// Purpose reserved for the token service signing key.
pub const TOKEN_SIGNING_PURPOSE: &str = "token:signing";

/// Purpose prefix for component identity seeds.
pub const IDENTITY_PURPOSE_PREFIX: &str = "identity:";

/// Purposes the manager derives for itself. Public `derive` refuses them.
pub fn is_reserved_purpose(purpose: &str) -> bool {
    purpose == TOKEN_SIGNING_PURPOSE || purpose.starts_with(IDENTITY_PURPOSE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Encrypted relational store.
    Libsql,
    /// Embedded key-value store.
    KeyValue,
    Other(String),
}

impl StoreKind {
    pub fn as_str(&self) -> &str {
        match self {
            StoreKind::Libsql => "libsql",
            StoreKind::KeyValue => "kv",
            StoreKind::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "libsql" => Ok(StoreKind::Libsql),
            "kv" => Ok(StoreKind::KeyValue),
            other if !other.is_empty() && !other.contains(':') => {
                Ok(StoreKind::Other(other.to_string()))
            }
            other => Err(CoreError::Malformed(format!("invalid store kind {other:?}"))),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical form of a store path: the filesystem's canonical path when it
/// exists, otherwise a lexically normalized absolute path. Two spellings of
/// the same file must yield the same key.
pub fn canonical_path(path: &Path) -> Result<PathBuf> {
    if let Ok(real) = std::fs::canonicalize(path) {
        return Ok(real);
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

pub fn store_purpose(kind: &StoreKind, path: &Path) -> Result<String> {
    let canonical = canonical_path(path)?;
    let path = canonical
        .to_str()
        .ok_or_else(|| CoreError::Malformed("store path is not valid UTF-8".into()))?;
    Ok(format!("{kind}:{path}"))
}

/// A store-specific key. Recomputed on every use, never persisted; the key
/// bytes are zeroized when the context is dropped.
pub struct DerivedKeyContext {
    purpose: String,
    key: SensitiveBytes32,
}

impl DerivedKeyContext {
    /// HKDF-SHA256 of the master secret with the purpose as `info`.
    pub fn derive(master: &SensitiveBytes32, purpose: &str) -> Result<Self> {
        if purpose.is_empty() {
            return Err(CoreError::Malformed("empty derivation purpose".into()));
        }
        let key = hkdf::expand(master.as_bytes(), Some(DERIVE_SALT), purpose.as_bytes())?;
        Ok(Self {
            purpose: purpose.to_string(),
            key,
        })
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn key(&self) -> &SensitiveBytes32 {
        &self.key
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }
}

impl fmt::Debug for DerivedKeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeyContext")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_stable_and_separated() {
        let master = SensitiveBytes32::new([1; 32]);
        let a1 = DerivedKeyContext::derive(&master, "libsql:/data/app.db").unwrap();
        let a2 = DerivedKeyContext::derive(&master, "libsql:/data/app.db").unwrap();
        let b = DerivedKeyContext::derive(&master, "kv:/data/cache").unwrap();

        assert_eq!(a1.as_bytes(), a2.as_bytes());
        assert_ne!(a1.as_bytes(), b.as_bytes());
        assert_ne!(a1.as_bytes(), master.as_bytes());
    }

    #[test]
    fn test_different_master_different_key() {
        let a = DerivedKeyContext::derive(&SensitiveBytes32::new([1; 32]), "p").unwrap();
        let b = DerivedKeyContext::derive(&SensitiveBytes32::new([2; 32]), "p").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_empty_purpose_rejected() {
        let master = SensitiveBytes32::new([1; 32]);
        assert!(DerivedKeyContext::derive(&master, "").is_err());
    }

    #[test]
    fn test_canonical_path_normalizes() {
        let a = canonical_path(Path::new("/nonexistent-root/data/./x/../app.db")).unwrap();
        assert_eq!(a, PathBuf::from("/nonexistent-root/data/app.db"));
    }

    #[test]
    fn test_store_purpose_uses_real_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.db");
        std::fs::write(&file, b"").unwrap();
        let via_dot = dir.path().join(".").join("app.db");
        assert_eq!(
            store_purpose(&StoreKind::Libsql, &file).unwrap(),
            store_purpose(&StoreKind::Libsql, &via_dot).unwrap()
        );
        assert!(store_purpose(&StoreKind::Libsql, &file)
            .unwrap()
            .starts_with("libsql:/"));
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!(StoreKind::parse("libsql").unwrap(), StoreKind::Libsql);
        assert_eq!(StoreKind::parse("kv").unwrap(), StoreKind::KeyValue);
        assert!(StoreKind::parse("a:b").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let ctx = DerivedKeyContext::derive(&SensitiveBytes32::new([1; 32]), "p").unwrap();
        assert!(format!("{ctx:?}").contains("purpose"));
        assert!(!format!("{ctx:?}").contains("SensitiveBytes32"));
    }
}
