/// Responder-side bookkeeping for concurrent handshake attempts.
///
/// Each attempt lives in its own `Handshake<Responder>` keyed by its
/// challenge; nothing is shared between attempts except the trust store.
/// A challenge is removed from the pending map before its hello is verified,
/// so it can be answered at most once.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::machine::{Handshake, Responder};
use super::messages::{Challenge, ChallengeMessage, ClientHello, ServerHello};
use super::trust::TrustStore;
use super::{HandshakeSession, DEFAULT_HANDSHAKE_TIMEOUT_SECS};
use crate::clock::SharedClock;
use crate::crypto::hash;
use crate::crypto::sign::IdentityKeyPair;
use crate::error::{CoreError, Result};

/// How long retired challenges are remembered, as a multiple of the timeout.
const RETIRED_RETENTION_FACTOR: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Consumed,
    Expired,
    Aborted,
}

pub struct HandshakeCoordinator {
    identity: Arc<IdentityKeyPair>,
    component: String,
    trust: Arc<TrustStore>,
    clock: SharedClock,
    timeout: Duration,
    pending: Mutex<HashMap<Challenge, Handshake<Responder>>>,
    retired: Mutex<HashMap<Challenge, (DateTime<Utc>, Retired)>>,
}

impl HandshakeCoordinator {
    pub fn new(
        identity: IdentityKeyPair,
        component: impl Into<String>,
        trust: Arc<TrustStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            component: component.into(),
            trust,
            clock,
            timeout: Duration::seconds(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            pending: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn identity_key(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    fn pending(&self) -> Result<MutexGuard<'_, HashMap<Challenge, Handshake<Responder>>>> {
        self.pending
            .lock()
            .map_err(|_| CoreError::StorageFailure("handshake table lock poisoned".into()))
    }

    fn retired(&self) -> Result<MutexGuard<'_, HashMap<Challenge, (DateTime<Utc>, Retired)>>> {
        self.retired
            .lock()
            .map_err(|_| CoreError::StorageFailure("handshake table lock poisoned".into()))
    }

    fn retire(&self, challenge: Challenge, reason: Retired) -> Result<()> {
        let now = self.clock.now();
        let mut retired = self.retired()?;
        retired.insert(challenge, (now, reason));
        Ok(())
    }

    /// Drop attempts past their deadline and forget old retired challenges.
    fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        let expired: Vec<Challenge> = {
            let mut pending = self.pending()?;
            let expired: Vec<Challenge> = pending
                .iter()
                .filter(|(_, hs)| hs.is_expired_at(now))
                .map(|(c, _)| *c)
                .collect();
            for challenge in &expired {
                pending.remove(challenge);
            }
            expired
        };

        let retention = self.timeout * RETIRED_RETENTION_FACTOR;
        let mut retired = self.retired()?;
        for challenge in expired {
            retired.insert(challenge, (now, Retired::Expired));
        }
        retired.retain(|_, (at, _)| now - *at <= retention);
        Ok(())
    }

    /// Start a new attempt with a fresh challenge.
    pub fn issue_challenge(&self) -> Result<ChallengeMessage> {
        self.sweep(self.clock.now())?;

        let mut handshake = Handshake::<Responder>::new(
            self.identity.clone(),
            self.component.clone(),
            self.timeout,
            self.clock.clone(),
        )?;
        let message = handshake.issue_challenge()?;
        self.pending()?.insert(message.challenge, handshake);
        debug!(component = %self.component, "handshake challenge issued");
        Ok(message)
    }

    /// Verify a client hello against its pending attempt and finish the
    /// handshake. The challenge is spent whatever the outcome.
    pub fn complete(&self, hello: &ClientHello) -> Result<(ServerHello, HandshakeSession)> {
        let taken = self.pending()?.remove(&hello.challenge);
        let Some(mut handshake) = taken else {
            let reason = self.retired()?.get(&hello.challenge).map(|(_, r)| *r);
            return Err(match reason {
                Some(Retired::Expired) => {
                    debug!(peer = %hello.component, "handshake hello after expiry");
                    CoreError::Timeout
                }
                _ => {
                    warn!(peer = %hello.component, "handshake challenge replayed or unknown");
                    CoreError::ReplayDetected
                }
            });
        };

        let outcome = handshake.accept(hello, &self.trust);
        let reason = match &outcome {
            Err(CoreError::Timeout) => Retired::Expired,
            _ => Retired::Consumed,
        };
        self.retire(hello.challenge, reason)?;

        match &outcome {
            Ok((_, session)) => info!(
                peer = %session.peer_component,
                fingerprint = %hash::fingerprint(&session.peer_identity),
                session_id = %session.session_id,
                "handshake established"
            ),
            Err(e) if e.is_auth_rejection() => {
                warn!(peer = %hello.component, "handshake rejected")
            }
            Err(e) => debug!(peer = %hello.component, error = %e, "handshake failed"),
        }
        outcome
    }

    /// Cancel a pending attempt. Returns whether one was pending.
    pub fn abort(&self, challenge: &Challenge) -> Result<bool> {
        let taken = self.pending()?.remove(challenge);
        match taken {
            Some(mut handshake) => {
                handshake.abort();
                self.retire(*challenge, Retired::Aborted)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }
}
