/// Cryptographic primitives used by the key manager, session cache,
/// handshake and token service.
pub mod aead;
pub mod agree;
pub mod hash;
pub mod hkdf;
pub mod kdf;
pub mod sensitive;
pub mod sign;
