/// X25519 ephemeral key agreement.
///
/// The secret half is an `EphemeralSecret`, which `diffie_hellman` consumes,
/// so an ephemeral key can take part in at most one agreement.
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;

pub struct EphemeralKeyPair {
    pub public_key: PublicKey,
    secret: EphemeralSecret,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self { public_key, secret }
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public_key.to_bytes()
    }

    /// Consume the key pair and compute the shared secret with a peer.
    ///
    /// Rejects non-contributory results (low-order peer points).
    pub fn agree(self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> Result<SensitiveBytes32> {
        let peer = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CoreError::AuthenticationFailed);
        }
        Ok(SensitiveBytes32::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}
