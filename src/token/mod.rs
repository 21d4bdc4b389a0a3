/// Bearer tokens gating API calls after authentication.
///
/// Tokens are HS256 JWTs signed with a key derived from the master secret
/// (`token:signing`), so they survive restarts without a stored signing key
/// and become unverifiable once the master secret is gone. Verification is
/// stateless apart from the revocation check.
pub mod revocation;

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::crypto::sensitive::SensitiveBytes32;
use crate::error::{CoreError, Result};
use crate::handshake::HandshakeSession;
use crate::keys::MasterKeyManager;

pub use revocation::{FileRevocationStore, MemoryRevocationStore, RevocationStore};

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// JWT claims for bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user or component id).
    pub sub: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Token id, the revocation handle.
    pub jti: String,
    /// Handshake session this token is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// An issued token. `encoded` is what the client presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub subject: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_id: String,
    /// Signature segment of the JWT.
    pub signature: String,
    pub encoded: String,
}

impl AuthToken {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

/// What a successful `verify` tells the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedToken {
    pub subject: String,
    pub token_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub session_id: Option<String>,
}

/// Whole-second `exp` no earlier than `deadline`.
fn expiry_secs(deadline: DateTime<Utc>) -> i64 {
    if deadline.timestamp_subsec_nanos() > 0 {
        deadline.timestamp() + 1
    } else {
        deadline.timestamp()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CoreError::Malformed(format!("timestamp out of range: {secs}")))
}

pub struct TokenService {
    signing_key: SensitiveBytes32,
    revocations: Arc<dyn RevocationStore>,
    clock: SharedClock,
}

impl TokenService {
    pub fn new(
        signing_key: SensitiveBytes32,
        revocations: Arc<dyn RevocationStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            signing_key,
            revocations,
            clock,
        }
    }

    /// Signing key derived from the unlocked master secret. `Locked` if the
    /// manager has no live session.
    pub fn from_manager(
        manager: &MasterKeyManager,
        revocations: Arc<dyn RevocationStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        let derived = manager.token_signing_key()?;
        Ok(Self::new(derived.key().clone(), revocations, clock))
    }

    pub fn revocations(&self) -> &Arc<dyn RevocationStore> {
        &self.revocations
    }

    /// Issue a token for `subject` valid for `ttl`. Call only after the
    /// caller has authenticated the subject.
    ///
    /// Token timestamps are whole seconds: `iat` is rounded down and `exp`
    /// up, so the token is never valid for less than `ttl`.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<AuthToken> {
        self.issue_claims(subject, ttl, None)
    }

    /// Issue a token bound to a completed handshake.
    pub fn issue_for_session(
        &self,
        subject: &str,
        ttl: Duration,
        session: &HandshakeSession,
    ) -> Result<AuthToken> {
        self.issue_claims(subject, ttl, Some(session.session_id.clone()))
    }

    fn issue_claims(&self, subject: &str, ttl: Duration, sid: Option<String>) -> Result<AuthToken> {
        if subject.is_empty() {
            return Err(CoreError::Malformed("empty token subject".into()));
        }
        if ttl <= Duration::zero() {
            return Err(CoreError::Malformed("token ttl must be positive".into()));
        }

        let now = self.clock.now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: expiry_secs(now + ttl),
            jti: Uuid::new_v4().to_string(),
            sid,
        };
        let encoded = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.signing_key.as_bytes()),
        )
        .map_err(|e| CoreError::Crypto(format!("JWT encoding failed: {e}")))?;

        let signature = encoded.rsplit('.').next().unwrap_or_default().to_string();
        debug!(token_id = %claims.jti, subject = %claims.sub, "token issued");
        Ok(AuthToken {
            subject: claims.sub,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
            token_id: claims.jti,
            signature,
            encoded,
        })
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is judged against the injected clock below.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp"]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.signing_key.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => CoreError::BadSignature,
            _ => CoreError::Malformed(format!("undecodable token: {e}")),
        })
    }

    /// Accept iff the signature verifies, `now < expires_at` and the token
    /// id is not revoked.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let claims = self.decode(token)?;
        let expires_at = timestamp(claims.exp)?;

        if self.clock.now() >= expires_at {
            debug!(token_id = %claims.jti, "token expired");
            return Err(CoreError::Expired);
        }
        if self.revocations.is_revoked(&claims.jti)? {
            debug!(token_id = %claims.jti, "token revoked");
            return Err(CoreError::Revoked);
        }

        Ok(VerifiedToken {
            subject: claims.sub,
            token_id: claims.jti,
            issued_at: timestamp(claims.iat)?,
            expires_at,
            session_id: claims.sid,
        })
    }

    /// Revoke by id. Takes effect for every `verify` that starts after this
    /// returns.
    pub fn revoke(&self, token_id: &str) -> Result<()> {
        if token_id.is_empty() {
            return Err(CoreError::Malformed("empty token id".into()));
        }
        self.revocations.revoke(token_id, None)?;
        info!(token_id, "token revoked");
        Ok(())
    }

    /// Revoke a token we hold, recording its expiry so the entry can be
    /// pruned later.
    pub fn revoke_token(&self, token: &AuthToken) -> Result<()> {
        self.revocations.revoke(&token.token_id, Some(token.expires_at))?;
        info!(token_id = %token.token_id, "token revoked");
        Ok(())
    }

    /// Forget revocations of tokens that have expired anyway.
    pub fn prune(&self) -> Result<usize> {
        let removed = self.revocations.prune(self.clock.now())?;
        if removed > 0 {
            debug!(removed, "pruned revocation record");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    use super::*;
    use crate::clock::ManualClock;

    fn service() -> (ManualClock, TokenService) {
        let clock = ManualClock::default();
        let service = TokenService::new(
            SensitiveBytes32::new([9; 32]),
            Arc::new(MemoryRevocationStore::new()),
            Arc::new(clock.clone()),
        );
        (clock, service)
    }

    #[test]
    fn test_issue_then_verify() {
        let (_, service) = service();
        let token = service.issue("alice", Duration::minutes(10)).unwrap();
        let verified = service.verify(token.as_str()).unwrap();
        assert_eq!(verified.subject, "alice");
        assert_eq!(verified.token_id, token.token_id);
        assert_eq!(verified.expires_at, token.expires_at);
        assert_eq!(verified.session_id, None);
        assert!(token.encoded.ends_with(&token.signature));
    }

    #[test]
    fn test_expired_at_boundary() {
        let (clock, service) = service();
        let token = service.issue("alice", Duration::minutes(10)).unwrap();
        clock.set(token.expires_at - Duration::seconds(1));
        assert!(service.verify(&token.encoded).is_ok());
        clock.set(token.expires_at);
        assert!(matches!(service.verify(&token.encoded), Err(CoreError::Expired)));
    }

    #[test]
    fn test_subsecond_issue_never_shortens_ttl() {
        let (clock, service) = service();
        let whole = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        clock.set(whole + Duration::milliseconds(999));

        let token = service.issue("alice", Duration::seconds(1)).unwrap();
        assert_eq!(token.issued_at, whole);
        assert_eq!(token.expires_at, whole + Duration::seconds(2));
        clock.advance(Duration::milliseconds(500));
        assert!(service.verify(&token.encoded).is_ok());

        clock.set(whole);
        let exact = service.issue("alice", Duration::seconds(1)).unwrap();
        assert_eq!(exact.expires_at, whole + Duration::seconds(1));
    }

    #[test]
    fn test_revoked_before_expiry() {
        let (_, service) = service();
        let token = service.issue("alice", Duration::minutes(10)).unwrap();
        service.revoke(&token.token_id).unwrap();
        assert!(matches!(service.verify(&token.encoded), Err(CoreError::Revoked)));

        let other = service.issue("alice", Duration::minutes(10)).unwrap();
        assert!(service.verify(&other.encoded).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_bad_signature() {
        let (_, service) = service();
        let token = service.issue("alice", Duration::minutes(10)).unwrap();
        let parts: Vec<&str> = token.encoded.split('.').collect();
        let mut claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        claims["sub"] = "mallory".into();
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            parts[2]
        );
        assert!(matches!(service.verify(&forged), Err(CoreError::BadSignature)));
    }

    #[test]
    fn test_other_key_is_bad_signature() {
        let (clock, service) = service();
        let other = TokenService::new(
            SensitiveBytes32::new([8; 32]),
            Arc::new(MemoryRevocationStore::new()),
            Arc::new(clock),
        );
        let token = other.issue("alice", Duration::minutes(10)).unwrap();
        assert!(matches!(service.verify(&token.encoded), Err(CoreError::BadSignature)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let (_, service) = service();
        assert!(matches!(service.verify("not-a-jwt"), Err(CoreError::Malformed(_))));
        assert!(matches!(service.verify(""), Err(CoreError::Malformed(_))));
    }

    #[test]
    fn test_invalid_issue_arguments() {
        let (_, service) = service();
        assert!(service.issue("", Duration::minutes(1)).is_err());
        assert!(service.issue("alice", Duration::zero()).is_err());
    }

    #[test]
    fn test_unique_token_ids() {
        let (_, service) = service();
        let a = service.issue("alice", Duration::minutes(1)).unwrap();
        let b = service.issue("alice", Duration::minutes(1)).unwrap();
        assert_ne!(a.token_id, b.token_id);
        assert_ne!(a.encoded, b.encoded);
    }

    #[test]
    fn test_prune_drops_expired_revocations() {
        let (clock, service) = service();
        let token = service.issue("alice", Duration::minutes(1)).unwrap();
        service.revoke_token(&token).unwrap();
        assert_eq!(service.prune().unwrap(), 0);
        clock.advance(Duration::minutes(2));
        assert_eq!(service.prune().unwrap(), 1);
        // Still refused: now expired instead of revoked.
        assert!(matches!(service.verify(&token.encoded), Err(CoreError::Expired)));
    }

    #[test]
    fn test_concurrent_revoke_is_seen() {
        let (_, service) = service();
        let token = service.issue("alice", Duration::minutes(10)).unwrap();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                service.revoke(&token.token_id).unwrap();
                // Anything verifying after revoke returned must fail.
                assert!(matches!(service.verify(&token.encoded), Err(CoreError::Revoked)));
            });
            s.spawn(|| {
                barrier.wait();
                // Racing verify: either outcome is fine, but only these two.
                match service.verify(&token.encoded) {
                    Ok(_) | Err(CoreError::Revoked) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            });
        });
        assert!(matches!(service.verify(&token.encoded), Err(CoreError::Revoked)));
    }
}
