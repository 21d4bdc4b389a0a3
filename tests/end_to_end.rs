use std::sync::Arc;

use chrono::Duration;

use keyvault_core::clock::{ManualClock, SharedClock};
use keyvault_core::crypto::kdf::KdfParams;
use keyvault_core::handshake::{
    Handshake, HandshakeCoordinator, Initiator, TrustPolicy, TrustStore,
};
use keyvault_core::token::{MemoryRevocationStore, TokenService};
use keyvault_core::{CoreConfig, CoreError};

fn config(dir: &std::path::Path) -> CoreConfig {
    let mut config = CoreConfig::new(dir);
    config.kdf = KdfParams::testing();
    config
}

#[test]
fn unlock_derive_lock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let manager = config(dir.path()).key_manager(Arc::new(clock.clone()));

    manager.setup("correct-horse").unwrap();
    manager.unlock(Some("correct-horse")).unwrap();

    let first = manager.derive("libsql:/data/app.db").unwrap();
    assert_eq!(first.as_bytes().len(), 32);
    let second = manager.derive("libsql:/data/app.db").unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());

    manager.lock().unwrap();
    assert!(matches!(
        manager.derive("libsql:/data/app.db"),
        Err(CoreError::Locked)
    ));

    // Same key after a fresh unlock.
    manager.unlock(Some("correct-horse")).unwrap();
    let again = manager.derive("libsql:/data/app.db").unwrap();
    assert_eq!(first.as_bytes(), again.as_bytes());
}

#[test]
fn session_survives_process_restart_until_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let mut cfg = config(dir.path());
    cfg.session_ttl = Duration::minutes(15);

    let first = cfg.key_manager(Arc::new(clock.clone()));
    first.setup("correct-horse").unwrap();
    first.unlock(Some("correct-horse")).unwrap();
    drop(first);

    clock.advance(Duration::minutes(14));
    let second = cfg.key_manager(Arc::new(clock.clone()));
    assert!(second.unlock(None).is_ok());

    clock.advance(Duration::minutes(16));
    let third = cfg.key_manager(Arc::new(clock.clone()));
    assert!(matches!(
        third.unlock(None),
        Err(CoreError::InteractionRequired)
    ));
}

#[test]
fn handshake_then_bound_token() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let cfg = config(dir.path());
    let manager = cfg.key_manager(shared.clone());
    manager.setup("correct-horse").unwrap();
    manager.unlock(Some("correct-horse")).unwrap();

    let server = HandshakeCoordinator::new(
        manager.component_identity("server").unwrap(),
        "server",
        Arc::new(cfg.trust_store().unwrap()),
        shared.clone(),
    )
    .with_timeout(cfg.handshake_timeout);
    let client_trust = TrustStore::in_memory(TrustPolicy::TrustOnFirstUse);
    let client_identity = Arc::new(keyvault_core::crypto::sign::IdentityKeyPair::generate());

    let mut client = Handshake::<Initiator>::new(
        client_identity.clone(),
        "cli",
        Duration::seconds(30),
        shared.clone(),
    )
    .unwrap();
    let hello = client.respond(&server.issue_challenge().unwrap()).unwrap();
    let (reply, server_session) = server.complete(&hello).unwrap();
    let client_session = client.finish(&reply, &client_trust).unwrap();
    assert_eq!(
        server_session.session_key().as_bytes(),
        client_session.session_key().as_bytes()
    );

    // Replaying the same hello is refused.
    assert!(matches!(server.complete(&hello), Err(CoreError::ReplayDetected)));

    // The pin made it to disk.
    let reopened = cfg.trust_store().unwrap();
    assert_eq!(
        reopened.pinned("cli").unwrap(),
        Some(client_identity.public_key_bytes())
    );

    let tokens = TokenService::from_manager(
        &manager,
        Arc::new(MemoryRevocationStore::new()),
        shared.clone(),
    )
    .unwrap();
    let token = tokens
        .issue_for_session("cli", Duration::minutes(5), &server_session)
        .unwrap();
    let verified = tokens.verify(&token.encoded).unwrap();
    assert_eq!(verified.subject, "cli");
    assert_eq!(verified.session_id.as_deref(), Some(server_session.session_id.as_str()));

    tokens.revoke(&token.token_id).unwrap();
    assert!(matches!(tokens.verify(&token.encoded), Err(CoreError::Revoked)));

    let fresh = tokens.issue("cli", Duration::minutes(5)).unwrap();
    clock.advance(Duration::minutes(6));
    assert!(matches!(tokens.verify(&fresh.encoded), Err(CoreError::Expired)));
}

#[test]
fn token_signing_key_is_stable_across_unlocks() {
    let dir = tempfile::tempdir().unwrap();
    let clock: SharedClock = Arc::new(ManualClock::default());
    let cfg = config(dir.path());
    let manager = cfg.key_manager(clock.clone());
    manager.setup("correct-horse").unwrap();
    manager.unlock(Some("correct-horse")).unwrap();

    let revocations = Arc::new(cfg.revocation_store());
    let issuer = TokenService::from_manager(&manager, revocations.clone(), clock.clone()).unwrap();
    let token = issuer.issue("alice", Duration::minutes(5)).unwrap();

    manager.lock().unwrap();
    assert!(matches!(
        TokenService::from_manager(&manager, revocations.clone(), clock.clone()),
        Err(CoreError::Locked)
    ));

    manager.unlock(Some("correct-horse")).unwrap();
    let verifier = TokenService::from_manager(&manager, revocations, clock).unwrap();
    assert_eq!(verifier.verify(&token.encoded).unwrap().subject, "alice");
}
