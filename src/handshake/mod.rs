/// Mutual-authentication handshake.
///
/// ```text
/// responder                                   initiator
///   ChallengeMessage {component, challenge}  ──▶
///                                            ◀──  ClientHello {component, identity_key,
///                                                   ephemeral_key, challenge, signature}
///   ServerHello {component, identity_key,    ──▶
///     ephemeral_key, challenge, signature}
/// ```
///
/// Both sides prove possession of their Ed25519 identity key and agree an
/// X25519 session key from fresh ephemeral keys, so a later compromise of an
/// identity key does not expose past session keys.
///
/// `Handshake<R>` is the per-attempt state machine shared by both roles;
/// `HandshakeCoordinator` tracks pending attempts on the responder side and
/// enforces single use of every challenge.
pub mod coordinator;
pub mod machine;
pub mod messages;
pub mod trust;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::crypto::sensitive::SensitiveBytes32;

pub use coordinator::HandshakeCoordinator;
pub use machine::{Handshake, Initiator, Responder, Role};
pub use messages::{Challenge, ChallengeMessage, ClientHello, ServerHello};
pub use trust::{TrustDecision, TrustPolicy, TrustStore};

/// Domain label for the initiator's signature.
pub(crate) const CLIENT_AUTH_LABEL: &str = "keyvault-core handshake v1 client-auth";
/// Domain label for the full exchange transcript signed by the responder.
pub(crate) const TRANSCRIPT_LABEL: &str = "keyvault-core handshake v1 transcript";
/// Prefix of the HKDF `info` for the session key.
pub(crate) const SESSION_KEY_LABEL: &[u8] = b"keyvault-core handshake v1 session-key";

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    ChallengeIssued,
    SignatureVerified,
    KeyAgreed,
    Established,
    /// Peer failed authentication.
    Rejected,
    /// Timed out, malformed input or a local error.
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandshakeState::Established | HandshakeState::Rejected | HandshakeState::Failed
        )
    }
}

/// Result of a completed handshake. The session key is the only secret
/// retained; both ephemeral secrets are gone by the time this exists.
pub struct HandshakeSession {
    /// Public fingerprint of the transcript.
    pub session_id: String,
    pub peer_component: String,
    pub peer_identity: [u8; 32],
    session_key: SensitiveBytes32,
    pub established_at: DateTime<Utc>,
}

impl HandshakeSession {
    pub(crate) fn new(
        session_id: String,
        peer_component: String,
        peer_identity: [u8; 32],
        session_key: SensitiveBytes32,
        established_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            peer_component,
            peer_identity,
            session_key,
            established_at,
        }
    }

    pub fn session_key(&self) -> &SensitiveBytes32 {
        &self.session_key
    }
}

impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("session_id", &self.session_id)
            .field("peer_component", &self.peer_component)
            .field("peer_identity", &hex::encode(self.peer_identity))
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_debug_redacts_key() {
        let session = HandshakeSession::new(
            "abc".into(),
            "cli".into(),
            [1; 32],
            SensitiveBytes32::new([0xAA; 32]),
            Utc::now(),
        );
        let dbg = format!("{session:?}");
        assert!(dbg.contains("abc"));
        assert!(!dbg.contains("aaaa"));
        assert!(!dbg.contains("session_key"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(HandshakeState::Established.is_terminal());
        assert!(HandshakeState::Rejected.is_terminal());
        assert!(!HandshakeState::KeyAgreed.is_terminal());
    }
}
