/// XChaCha20-Poly1305 sealing for the wrapped master secret and the
/// on-disk session cache.
///
/// Every seal draws a fresh random 24-byte nonce; XChaCha20's nonce is wide
/// enough for random generation without practical collision risk.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::crypto::sensitive::{SensitiveBytes32, SensitiveVec};
use crate::error::{CoreError, Result};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Generate a random 24-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, authenticating `aad`.
///
/// Returns (nonce, ciphertext_with_tag).
pub fn encrypt(
    key: &SensitiveBytes32,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CoreError::Crypto(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CoreError::Crypto(format!("encryption failed: {e}")))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt and authenticate. Any tag mismatch (wrong key, tampered
/// ciphertext, wrong AAD) surfaces as `CoreError::Crypto`; callers map it
/// to their own failure kind.
pub fn decrypt(
    key: &SensitiveBytes32,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<SensitiveVec> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| CoreError::Crypto(e.to_string()))?;

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CoreError::Crypto("decryption failed".to_string()))?;

    Ok(SensitiveVec::new(plaintext))
}

/// Parse a hex-encoded nonce.
pub fn nonce_from_hex(encoded: &str) -> Result<[u8; NONCE_LEN]> {
    let bytes = hex::decode(encoded).map_err(|e| CoreError::Malformed(format!("nonce: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::Malformed("nonce must be 24 bytes".to_string()))
}
