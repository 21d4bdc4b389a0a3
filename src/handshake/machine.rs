/// Per-attempt handshake state machine, generic over the role.
///
/// Verification, agreement and key derivation are shared by both roles so
/// the initiator and responder cannot drift apart; the role only decides
/// which message a step consumes and which it produces.
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use super::messages::{validate_component, Challenge, ChallengeMessage, ClientHello, ServerHello};
use super::trust::{TrustDecision, TrustStore};
use super::{
    HandshakeSession, HandshakeState, CLIENT_AUTH_LABEL, SESSION_KEY_LABEL, TRANSCRIPT_LABEL,
};
use crate::clock::SharedClock;
use crate::crypto::agree::EphemeralKeyPair;
use crate::crypto::hash::{self, Transcript};
use crate::crypto::{hkdf, sign};
use crate::crypto::sensitive::SensitiveBytes32;
use crate::crypto::sign::IdentityKeyPair;
use crate::error::{CoreError, Result};

mod sealed {
    pub trait Sealed {}
}

pub trait Role: sealed::Sealed + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Connecting side; answers a challenge.
#[derive(Debug)]
pub struct Initiator;

/// Accepting side; issues challenges.
#[derive(Debug)]
pub struct Responder;

impl sealed::Sealed for Initiator {}
impl sealed::Sealed for Responder {}

impl Role for Initiator {
    const NAME: &'static str = "initiator";
}

impl Role for Responder {
    const NAME: &'static str = "responder";
}

/// Public fields of the initiator's half, as signed by the initiator.
struct ClientHalf<'a> {
    component: &'a str,
    identity_key: &'a [u8; 32],
    ephemeral_key: &'a [u8; 32],
}

/// Public fields of the responder's half.
struct ServerHalf<'a> {
    component: &'a str,
    identity_key: &'a [u8; 32],
    ephemeral_key: &'a [u8; 32],
}

fn client_auth_message(challenge: &Challenge, client: &ClientHalf<'_>) -> [u8; 32] {
    Transcript::new(CLIENT_AUTH_LABEL)
        .append(challenge)
        .append(client.component.as_bytes())
        .append(client.identity_key)
        .append(client.ephemeral_key)
        .finish()
}

fn transcript_hash(challenge: &Challenge, client: &ClientHalf<'_>, server: &ServerHalf<'_>) -> [u8; 32] {
    Transcript::new(TRANSCRIPT_LABEL)
        .append(challenge)
        .append(client.component.as_bytes())
        .append(client.identity_key)
        .append(client.ephemeral_key)
        .append(server.component.as_bytes())
        .append(server.identity_key)
        .append(server.ephemeral_key)
        .finish()
}

pub struct Handshake<R: Role> {
    state: HandshakeState,
    identity: Arc<IdentityKeyPair>,
    component: String,
    challenge: Option<Challenge>,
    /// Component named in the challenge (initiator only).
    expected_peer: Option<String>,
    ephemeral: Option<EphemeralKeyPair>,
    ephemeral_public: Option<[u8; 32]>,
    started_at: Option<DateTime<Utc>>,
    timeout: Duration,
    clock: SharedClock,
    _role: PhantomData<R>,
}

impl<R: Role> std::fmt::Debug for Handshake<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &R::NAME)
            .field("state", &self.state)
            .field("component", &self.component)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl<R: Role> Handshake<R> {
    pub fn new(
        identity: Arc<IdentityKeyPair>,
        component: impl Into<String>,
        timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self> {
        let component = component.into();
        validate_component(&component)?;
        Ok(Self {
            state: HandshakeState::Init,
            identity,
            component,
            challenge: None,
            expected_peer: None,
            ephemeral: None,
            ephemeral_public: None,
            started_at: None,
            timeout,
            clock,
            _role: PhantomData,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Whether the attempt is past its deadline at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.started_at
            .map(|started| now > started + self.timeout)
            .unwrap_or(false)
    }

    /// Cancel the attempt. The ephemeral secret is dropped.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.ephemeral = None;
            self.state = HandshakeState::Failed;
            debug!(role = R::NAME, "handshake aborted");
        }
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoreError::Malformed(format!(
                "handshake step out of order: in state {:?}",
                self.state
            )))
        }
    }

    fn check_deadline(&self) -> Result<()> {
        if self.is_expired_at(self.clock.now()) {
            Err(CoreError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Run one step; any error is terminal for the attempt.
    fn step<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.state.is_terminal() {
            return Err(CoreError::Malformed(format!(
                "handshake already finished: {:?}",
                self.state
            )));
        }
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.ephemeral = None;
                self.state = if err.is_auth_rejection() {
                    HandshakeState::Rejected
                } else {
                    HandshakeState::Failed
                };
                warn!(role = R::NAME, component = %self.component, error = %err, "handshake attempt failed");
                Err(err)
            }
        }
    }

    /// Identity check then signature check. Both failures surface as
    /// `AuthenticationFailed`.
    fn verify_peer(
        &mut self,
        trust: &TrustStore,
        component: &str,
        identity_key: &[u8; 32],
        signed: &[u8; 32],
        signature: &[u8; 64],
    ) -> Result<TrustDecision> {
        validate_component(component)?;
        let decision = trust.check(component, identity_key)?;
        sign::verify(identity_key, signed, signature).map_err(|_| CoreError::AuthenticationFailed)?;
        self.state = HandshakeState::SignatureVerified;
        Ok(decision)
    }

    /// Agree with the peer's ephemeral key and derive the session key.
    fn agree_session_key(
        &mut self,
        ephemeral: EphemeralKeyPair,
        peer_ephemeral: &[u8; 32],
        challenge: &Challenge,
        transcript: &[u8; 32],
    ) -> Result<SensitiveBytes32> {
        let shared = ephemeral.agree(peer_ephemeral)?;
        let mut info = Vec::with_capacity(SESSION_KEY_LABEL.len() + transcript.len());
        info.extend_from_slice(SESSION_KEY_LABEL);
        info.extend_from_slice(transcript);
        let key = hkdf::expand(shared.as_bytes(), Some(&challenge[..]), &info)?;
        self.state = HandshakeState::KeyAgreed;
        Ok(key)
    }

    fn establish(
        &mut self,
        trust: &TrustStore,
        decision: TrustDecision,
        peer_component: &str,
        peer_identity: [u8; 32],
        transcript: &[u8; 32],
        session_key: SensitiveBytes32,
    ) -> Result<HandshakeSession> {
        if decision == TrustDecision::FirstUse {
            trust.pin(peer_component, &peer_identity)?;
        }
        self.state = HandshakeState::Established;
        let session = HandshakeSession::new(
            hash::fingerprint(transcript),
            peer_component.to_string(),
            peer_identity,
            session_key,
            self.clock.now(),
        );
        debug!(
            role = R::NAME,
            peer = %session.peer_component,
            session_id = %session.session_id,
            "handshake established"
        );
        Ok(session)
    }
}

impl Handshake<Responder> {
    /// Step 1: a fresh random challenge; starts the deadline.
    pub fn issue_challenge(&mut self) -> Result<ChallengeMessage> {
        self.step(|hs| {
            hs.expect_state(HandshakeState::Init)?;
            let mut challenge = [0u8; 32];
            OsRng.fill_bytes(&mut challenge);
            hs.challenge = Some(challenge);
            hs.started_at = Some(hs.clock.now());
            hs.state = HandshakeState::ChallengeIssued;
            Ok(ChallengeMessage {
                component: hs.component.clone(),
                challenge,
            })
        })
    }

    /// Steps 3 to 5: verify the initiator, agree, sign the transcript.
    pub fn accept(
        &mut self,
        hello: &ClientHello,
        trust: &TrustStore,
    ) -> Result<(ServerHello, HandshakeSession)> {
        self.step(|hs| {
            hs.expect_state(HandshakeState::ChallengeIssued)?;
            hs.check_deadline()?;
            let challenge = hs
                .challenge
                .ok_or_else(|| CoreError::Malformed("no challenge issued".into()))?;
            if !hash::digest_eq(&challenge, &hello.challenge) {
                return Err(CoreError::ReplayDetected);
            }

            let client = ClientHalf {
                component: &hello.component,
                identity_key: &hello.identity_key,
                ephemeral_key: &hello.ephemeral_key,
            };
            let signed = client_auth_message(&challenge, &client);
            let decision = hs.verify_peer(
                trust,
                &hello.component,
                &hello.identity_key,
                &signed,
                &hello.signature,
            )?;

            let ephemeral = EphemeralKeyPair::generate();
            let ephemeral_key = ephemeral.public_key_bytes();
            let identity_key = hs.identity.public_key_bytes();
            let server = ServerHalf {
                component: &hs.component,
                identity_key: &identity_key,
                ephemeral_key: &ephemeral_key,
            };
            let transcript = transcript_hash(&challenge, &client, &server);
            let session_key =
                hs.agree_session_key(ephemeral, &hello.ephemeral_key, &challenge, &transcript)?;
            let signature = hs.identity.sign(&transcript);

            let reply = ServerHello {
                component: hs.component.clone(),
                identity_key,
                ephemeral_key,
                challenge,
                signature,
            };
            let session = hs.establish(
                trust,
                decision,
                &hello.component,
                hello.identity_key,
                &transcript,
                session_key,
            )?;
            Ok((reply, session))
        })
    }
}

impl Handshake<Initiator> {
    /// Step 2: sign the challenge together with a fresh ephemeral key.
    pub fn respond(&mut self, challenge: &ChallengeMessage) -> Result<ClientHello> {
        self.step(|hs| {
            hs.expect_state(HandshakeState::Init)?;
            validate_component(&challenge.component)?;

            let ephemeral = EphemeralKeyPair::generate();
            let ephemeral_key = ephemeral.public_key_bytes();
            let identity_key = hs.identity.public_key_bytes();
            let signed = client_auth_message(
                &challenge.challenge,
                &ClientHalf {
                    component: &hs.component,
                    identity_key: &identity_key,
                    ephemeral_key: &ephemeral_key,
                },
            );

            hs.challenge = Some(challenge.challenge);
            hs.expected_peer = Some(challenge.component.clone());
            hs.ephemeral = Some(ephemeral);
            hs.ephemeral_public = Some(ephemeral_key);
            hs.started_at = Some(hs.clock.now());
            hs.state = HandshakeState::ChallengeIssued;

            Ok(ClientHello {
                component: hs.component.clone(),
                identity_key,
                ephemeral_key,
                challenge: challenge.challenge,
                signature: hs.identity.sign(&signed),
            })
        })
    }

    /// Step 6: verify the responder and derive the same session key.
    pub fn finish(&mut self, hello: &ServerHello, trust: &TrustStore) -> Result<HandshakeSession> {
        self.step(|hs| {
            hs.expect_state(HandshakeState::ChallengeIssued)?;
            hs.check_deadline()?;
            let (Some(challenge), Some(ephemeral_public)) = (hs.challenge, hs.ephemeral_public)
            else {
                return Err(CoreError::Malformed("no challenge answered".into()));
            };
            if !hash::digest_eq(&challenge, &hello.challenge) {
                return Err(CoreError::ReplayDetected);
            }
            if hs.expected_peer.as_deref() != Some(hello.component.as_str()) {
                return Err(CoreError::AuthenticationFailed);
            }

            let identity_key = hs.identity.public_key_bytes();
            let component = hs.component.clone();
            let client = ClientHalf {
                component: &component,
                identity_key: &identity_key,
                ephemeral_key: &ephemeral_public,
            };
            let server = ServerHalf {
                component: &hello.component,
                identity_key: &hello.identity_key,
                ephemeral_key: &hello.ephemeral_key,
            };
            let transcript = transcript_hash(&challenge, &client, &server);
            let decision = hs.verify_peer(
                trust,
                &hello.component,
                &hello.identity_key,
                &transcript,
                &hello.signature,
            )?;

            let ephemeral = hs
                .ephemeral
                .take()
                .ok_or_else(|| CoreError::Malformed("ephemeral key already used".into()))?;
            let session_key =
                hs.agree_session_key(ephemeral, &hello.ephemeral_key, &challenge, &transcript)?;
            hs.establish(
                trust,
                decision,
                &hello.component,
                hello.identity_key,
                &transcript,
                session_key,
            )
        })
    }
}
