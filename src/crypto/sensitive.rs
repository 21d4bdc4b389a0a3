/// Key material wrappers that zeroize on drop and never print their contents.
use std::fmt;

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 32-byte secret (master secret, derived key, session key).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes32([u8; 32]);

impl SensitiveBytes32 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &Self) -> bool {
        blake3::Hash::from(self.0) == blake3::Hash::from(other.0)
    }
}

impl AsRef<[u8]> for SensitiveBytes32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveBytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SensitiveBytes32(<redacted>)")
    }
}

/// A variable-length secret buffer.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveVec(Vec<u8>);

impl SensitiveVec {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SensitiveVec {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveVec(<{} bytes redacted>)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_length_checked() {
        assert!(SensitiveBytes32::from_slice(&[0u8; 32]).is_some());
        assert!(SensitiveBytes32::from_slice(&[0u8; 16]).is_none());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SensitiveBytes32::new([0xAA; 32]);
        let printed = format!("{key:?}");
        assert!(!printed.contains("170"));
        assert!(!printed.to_lowercase().contains("aa"));
        let v = SensitiveVec::new(vec![0xAB, 0xCD]);
        assert_eq!(format!("{v:?}"), "SensitiveVec(<2 bytes redacted>)");
    }

    #[test]
    fn test_ct_eq() {
        let a = SensitiveBytes32::new([1; 32]);
        let b = SensitiveBytes32::new([1; 32]);
        let c = SensitiveBytes32::new([2; 32]);
        assert!(a.ct_eq(&b));
        assert!(!a.ct_eq(&c));
    }

    #[test]
    fn test_random_keys_differ() {
        assert!(!SensitiveBytes32::random().ct_eq(&SensitiveBytes32::random()));
    }
}
