//! keyvault-core: local trust core for a personal application.
//!
//! - [`keys`]: master secret custody (Argon2id + XChaCha20-Poly1305) and
//!   per-store key derivation
//! - [`session`]: unlocked-key cache with sliding expiry, shared across
//!   processes through an encrypted file
//! - [`handshake`]: Ed25519/X25519 mutual authentication with forward
//!   secrecy
//! - [`token`]: HS256 bearer tokens and revocation
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod persist;
pub mod secret_store;
pub mod session;
pub mod token;

pub use config::{ConfigError, CoreConfig};
pub use error::{CoreError, Result};
pub use handshake::{HandshakeCoordinator, HandshakeSession};
pub use keys::{DerivedKeyContext, MasterKeyManager, MasterSecret, StoreKind};
pub use session::{SessionCache, SessionInfo};
pub use token::{AuthToken, TokenService, VerifiedToken};
