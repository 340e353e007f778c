use chrono::Duration;
use datavault::auth::{AuthFactor, AuthManager, FactorKind};
use datavault::encoding;
use datavault::keys::SigningKey;
use datavault::{ErrorKind, VaultConfig, VaultError};

const PASSPHRASE: &str = "correct horse battery staple";

fn manager(root: &std::path::Path) -> AuthManager {
    AuthManager::open(&VaultConfig::for_testing(root)).unwrap()
}

/// Enroll a fresh device key and return the matching device factor.
fn enroll_phone(auth: &mut AuthManager, user: &str) -> AuthFactor {
    let key = SigningKey::generate().unwrap();
    auth.enroll_device(user, "phone", "Pixel", &key.public_key_base64())
        .unwrap();
    AuthFactor::device("phone", encoding::encode(key.sign(b"phone")))
}

#[test]
fn test_mfa_gating() {
    // Goal: passphrase alone never yields a session once MFA is on.
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    auth.create_user("alice", PASSPHRASE, true).unwrap();
    let device = enroll_phone(&mut auth, "alice");

    // 1. Passphrase alone is refused with the distinguished outcome.
    let err = auth
        .authenticate("alice", AuthFactor::passphrase(PASSPHRASE))
        .unwrap_err();
    assert!(err.requires_mfa());
    assert_eq!(err.kind(), ErrorKind::AuthFailure);

    // 2. Passphrase plus device succeeds.
    let session = auth
        .authenticate_mfa("alice", &[AuthFactor::passphrase(PASSPHRASE), device])
        .unwrap();
    assert_eq!(session.factors, vec![FactorKind::Passphrase, FactorKind::Device]);
    assert_eq!(session.device_id.as_deref(), Some("phone"));
}

#[test]
fn test_mfa_is_all_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    auth.create_user("alice", PASSPHRASE, true).unwrap();
    let device = enroll_phone(&mut auth, "alice");

    let err = auth
        .authenticate_mfa("alice", &[AuthFactor::passphrase("wrong"), device])
        .unwrap_err();
    assert!(matches!(err, VaultError::AuthFailure(_)));
    assert!(!err.requires_mfa());
}

#[test]
fn test_forged_device_signature_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    auth.create_user("alice", PASSPHRASE, false).unwrap();
    enroll_phone(&mut auth, "alice");

    // Signed by a key that was never enrolled.
    let impostor = SigningKey::generate().unwrap();
    let forged = AuthFactor::device("phone", encoding::encode(impostor.sign(b"phone")));
    assert!(auth.authenticate("alice", forged).is_err());

    // Unknown device id.
    let unknown = AuthFactor::device("tablet", encoding::encode(impostor.sign(b"tablet")));
    assert!(auth.authenticate("alice", unknown).is_err());
}

#[test]
fn test_single_factor_without_mfa() {
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    auth.create_user("bob", PASSPHRASE, false).unwrap();

    let session = auth
        .authenticate("bob", AuthFactor::passphrase(PASSPHRASE))
        .unwrap();
    assert!(auth.validate_session(&session.session_id).is_ok());
    assert!(matches!(
        auth.authenticate("nobody", AuthFactor::passphrase(PASSPHRASE)),
        Err(VaultError::NotFound { .. })
    ));
}

#[test]
fn test_session_expiry() {
    // A session is valid right after creation and invalid once createdAt + TTL passes.
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    let session = auth.create_user("alice", PASSPHRASE, false).unwrap();

    assert_eq!(session.expires_at - session.created_at, Duration::hours(24));
    assert!(auth
        .validate_session_at(&session.session_id, session.created_at)
        .is_ok());
    assert!(auth
        .validate_session_at(&session.session_id, session.expires_at - Duration::seconds(1))
        .is_ok());

    let err = auth
        .validate_session_at(&session.session_id, session.expires_at)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
}

#[test]
fn test_cleanup_and_revocation_persist() {
    let dir = tempfile::tempdir().unwrap();
    let (expired_id, revoked_id, live_id) = {
        let mut auth = manager(dir.path());
        let first = auth.create_user("alice", PASSPHRASE, false).unwrap();
        let revoked = auth
            .authenticate("alice", AuthFactor::passphrase(PASSPHRASE))
            .unwrap();
        auth.revoke_session(&revoked.session_id).unwrap();

        let removed = auth
            .cleanup_expired_sessions_at(first.expires_at + Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 1);

        let live = auth
            .authenticate("alice", AuthFactor::passphrase(PASSPHRASE))
            .unwrap();
        (first.session_id, revoked.session_id, live.session_id)
    };

    // Reload from disk: the mutations above were persisted.
    let auth = manager(dir.path());
    let ids: Vec<String> = auth
        .list_sessions("alice")
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(ids, vec![live_id]);
    assert!(!ids.contains(&expired_id));
    assert!(!ids.contains(&revoked_id));
}

#[test]
fn test_corrupt_auth_store_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("auth.json"), b"{ truncated").unwrap();

    let err = AuthManager::open(&VaultConfig::for_testing(dir.path())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptState);
}

#[test]
fn test_duplicate_device_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    auth.create_user("alice", PASSPHRASE, false).unwrap();
    enroll_phone(&mut auth, "alice");

    let key = SigningKey::generate().unwrap();
    let err = auth
        .enroll_device("alice", "phone", "Other", &key.public_key_base64())
        .unwrap_err();
    assert!(matches!(err, VaultError::StateConflict(_)));
    assert_eq!(auth.devices("alice").unwrap().len(), 1);
}

#[test]
fn test_remove_user() {
    let dir = tempfile::tempdir().unwrap();
    let mut auth = manager(dir.path());
    let session = auth.create_user("alice", PASSPHRASE, false).unwrap();
    auth.remove_user("alice").unwrap();

    assert!(!auth.user_exists("alice"));
    assert!(auth.validate_session(&session.session_id).is_err());
    // The id is free again.
    auth.create_user("alice", PASSPHRASE, true).unwrap();
    assert!(auth.is_mfa_enabled("alice").unwrap());
}
