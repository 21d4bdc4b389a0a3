/// HKDF-SHA256 (RFC 5869) expansion into independent 32-byte sub-keys.
///
/// A derived key reveals nothing about the input keying material or about
/// any sibling key expanded with a different `info`.
use ::hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub fn expand(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<SensitiveBytes32> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);

    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| CoreError::Crypto(format!("HKDF expand failed: {e}")))?;

    Ok(SensitiveBytes32::new(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_is_deterministic() {
        let a = expand(&[1; 32], Some(b"salt"), b"libsql:/data/app.db").unwrap();
        let b = expand(&[1; 32], Some(b"salt"), b"libsql:/data/app.db").unwrap();
        assert!(a.ct_eq(&b));
    }

    #[test]
    fn test_info_separates_keys() {
        let a = expand(&[1; 32], None, b"libsql:/a").unwrap();
        let b = expand(&[1; 32], None, b"libsql:/b").unwrap();
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn test_salt_separates_keys() {
        let a = expand(&[1; 32], Some(b"one"), b"x").unwrap();
        let b = expand(&[1; 32], Some(b"two"), b"x").unwrap();
        assert!(!a.ct_eq(&b));
    }
}
