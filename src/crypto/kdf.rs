/// Argon2id passphrase stretching for the master-secret wrapping key.
///
/// Default parameters: t=3, m=256MB, p=4.
/// The parameters used at setup are persisted next to the salt so a later
/// unlock re-derives with exactly the same cost.
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub const SALT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Cheap parameters (1 MiB, one pass). Only for tests.
    pub fn testing() -> Self {
        Self {
            time_cost: 1,
            memory_kib: 1024,
            parallelism: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_kib: 262_144, // 256 MiB
            parallelism: 4,
        }
    }
}

/// Generate a random 32-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte key from a passphrase using Argon2id.
///
/// CPU and memory bound; async callers should run it on a blocking thread.
pub fn derive_key(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<SensitiveBytes32> {
    let params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CoreError::Crypto(format!("argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| CoreError::Crypto(format!("argon2: {e}")))?;

    Ok(SensitiveBytes32::new(output))
}
