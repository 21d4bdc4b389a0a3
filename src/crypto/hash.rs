/// BLAKE3 hashing utilities.
///
/// Used for:
/// - The master-secret check value stored next to the wrapped secret
/// - Handshake transcript hashing
/// - Public fingerprints (session ids, identity fingerprints)

/// Domain-separation context for the master-secret check value.
const CHECK_VALUE_CONTEXT: &str = "keyvault-core 2024 master-secret check value v1";

/// Hash arbitrary data with BLAKE3.
pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// One-way check value for the master secret. Proves a candidate secret is
/// the right one without storing anything that can recover it.
pub fn check_value(secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(CHECK_VALUE_CONTEXT);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Constant-time comparison of two 32-byte digests.
pub fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    blake3::Hash::from(*a) == blake3::Hash::from(*b)
}

/// Short public fingerprint (first 16 bytes, hex).
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(&hash(data)[..16])
}

/// Incremental transcript hash with length-prefixed fields so that field
/// boundaries cannot be shifted.
pub struct Transcript {
    hasher: blake3::Hasher,
}

impl Transcript {
    pub fn new(label: &str) -> Self {
        Self {
            hasher: blake3::Hasher::new_derive_key(label),
        }
    }

    pub fn append(&mut self, field: &[u8]) -> &mut Self {
        self.hasher.update(&(field.len() as u32).to_be_bytes());
        self.hasher.update(field);
        self
    }

    pub fn finish(&self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}
