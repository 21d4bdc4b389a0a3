/// Wrapped master-secret record, serialized into the secret store.
///
/// The master secret is sealed under an Argon2id key derived from the
/// passphrase. The check value lets unlock confirm the unwrapped secret
/// without storing anything that recovers it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::kdf::{self, KdfParams};
use crate::crypto::sensitive::SensitiveBytes32;
use crate::crypto::{aead, hash};
use crate::error::{CoreError, Result};

/// AAD binding the wrapped secret to this record format.
const WRAP_AAD: &[u8] = b"keyvault-core-master-wrap-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStoreRecord {
    /// Version of the record format.
    pub version: u32,
    /// Argon2id parameters used at wrap time.
    pub kdf: KdfParams,
    /// Argon2id salt (32 bytes, hex-encoded).
    pub kdf_salt: String,
    /// Nonce used to wrap the master secret (hex-encoded).
    pub master_nonce: String,
    /// Wrapped master secret, 32 + 16 tag bytes (hex-encoded).
    pub wrapped_master: String,
    /// BLAKE3 check value of the master secret (hex-encoded).
    pub check_value: String,
    pub created_at: DateTime<Utc>,
    pub rewrapped_at: Option<DateTime<Utc>>,
}

impl KeyStoreRecord {
    pub const CURRENT_VERSION: u32 = 1;

    /// Seal `master` under a fresh salt and the given passphrase.
    pub fn wrap(
        master: &SensitiveBytes32,
        passphrase: &str,
        params: KdfParams,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let salt = kdf::generate_salt();
        let kek = kdf::derive_key(passphrase.as_bytes(), &salt, &params)?;
        let (nonce, wrapped) = aead::encrypt(&kek, master.as_bytes(), WRAP_AAD)?;

        Ok(Self {
            version: Self::CURRENT_VERSION,
            kdf: params,
            kdf_salt: hex::encode(salt),
            master_nonce: hex::encode(nonce),
            wrapped_master: hex::encode(wrapped),
            check_value: hex::encode(hash::check_value(master.as_bytes())),
            created_at,
            rewrapped_at: None,
        })
    }

    /// Re-derive the wrapping key and recover the master secret.
    ///
    /// A wrong passphrase fails the AEAD tag or the check value and yields
    /// `InvalidPassphrase`; a damaged record yields `StorageFailure`.
    pub fn unwrap_secret(&self, passphrase: &str) -> Result<SensitiveBytes32> {
        if self.version != Self::CURRENT_VERSION {
            return Err(CoreError::StorageFailure(format!(
                "unsupported key store version {}",
                self.version
            )));
        }
        let salt = decode_hex("kdf_salt", &self.kdf_salt)?;
        let nonce = aead::nonce_from_hex(&self.master_nonce)
            .map_err(|_| CoreError::StorageFailure("corrupt master nonce".into()))?;
        let wrapped = decode_hex("wrapped_master", &self.wrapped_master)?;
        let expected: [u8; 32] = decode_hex("check_value", &self.check_value)?
            .try_into()
            .map_err(|_| CoreError::StorageFailure("check value must be 32 bytes".into()))?;

        let kek = kdf::derive_key(passphrase.as_bytes(), &salt, &self.kdf)?;
        let plaintext = aead::decrypt(&kek, &nonce, &wrapped, WRAP_AAD)
            .map_err(|_| CoreError::InvalidPassphrase)?;
        let master = SensitiveBytes32::from_slice(plaintext.as_bytes())
            .ok_or_else(|| CoreError::StorageFailure("wrapped secret has wrong length".into()))?;

        if !hash::digest_eq(&hash::check_value(master.as_bytes()), &expected) {
            return Err(CoreError::InvalidPassphrase);
        }
        Ok(master)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::StorageFailure(format!("corrupt key store record: {e}")))
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| CoreError::StorageFailure(format!("corrupt {field}: {e}")))
}
