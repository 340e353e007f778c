use chrono::Duration;
use datavault::keys::SigningKey;
use datavault::package::{decrypt_package_with, DataPackage, DataPackager, PackageOptions};
use datavault::transport::{DeliveryOptions, SecureTransport};
use datavault::{ErrorKind, VaultConfig, VaultError};
use serde_json::{json, Value};

fn record() -> Value {
    json!({
        "patient": {"name": "John Doe"},
        "vaccinations": ["MMR", "Tdap"],
        "insuranceId": "INS-0042",
    })
}

fn package(packager: &DataPackager) -> (DataPackage, datavault::keys::PackageKey) {
    packager
        .create_package(
            "req-1",
            "clinic-7",
            "medical",
            &["patient".to_string(), "vaccinations".to_string()],
            &record(),
            PackageOptions::default(),
        )
        .unwrap()
}

#[test]
fn test_package_integrity() {
    // Goal: valid on creation, invalid after any signed field changes.
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, _) = package(&packager);
    assert!(packager.is_package_valid(&pkg));

    let mut redirected = pkg.clone();
    redirected.recipient = "data-broker".into();
    assert!(!packager.is_package_valid(&redirected));

    let mut widened = pkg.clone();
    widened.fields.push("insuranceId".into());
    assert!(!packager.is_package_valid(&widened));

    let mut extended = pkg.clone();
    extended.metadata.expires_at = extended.metadata.expires_at + Duration::days(365);
    assert!(!packager.is_package_valid(&extended));

    let mut flipped = pkg;
    flipped.ciphertext[0] ^= 0x01;
    assert!(!packager.is_package_valid(&flipped));
}

#[test]
fn test_expired_package_invalid_regardless_of_signature() {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, key) = package(&packager);
    let after = pkg.metadata.expires_at + Duration::seconds(1);

    assert!(packager.verify_package(&pkg));
    assert!(!packager.is_package_valid_at(&pkg, after));
    let err = packager.decrypt_package_at(&pkg, &key, after).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
}

#[test]
fn test_tampered_package_does_not_decrypt() {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (mut pkg, key) = package(&packager);
    pkg.recipient = "data-broker".into();
    assert!(matches!(
        packager.decrypt_package(&pkg, &key),
        Err(VaultError::IntegrityFailure)
    ));
}

#[test]
fn test_recipient_opens_with_public_key_only() {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, key) = package(&packager);

    // What travels: the package as JSON, the key out of band, the vault's public key.
    let wire = serde_json::to_string(&pkg).unwrap();
    let received: DataPackage = serde_json::from_str(&wire).unwrap();
    let shared_key = datavault::keys::PackageKey::from_base64(&key.to_base64()).unwrap();

    let payload = decrypt_package_with(
        &packager.public_key(),
        &received,
        &shared_key,
        received.metadata.created_at,
    )
    .unwrap();
    assert_eq!(payload["patient"]["name"], "John Doe");
    assert!(payload.get("insuranceId").is_none());
    assert_eq!(payload["_watermark"]["recipient"], "clinic-7");
}

#[test]
fn test_token_single_use() {
    // Goal: a used token fails validation even inside its TTL.
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, _) = package(&packager);
    let mut transport = SecureTransport::new(&VaultConfig::default()).unwrap();

    let delivery = transport
        .deliver_package(&pkg, DeliveryOptions::portal())
        .unwrap();
    let token = transport.validate_access_token(&delivery.token_id).unwrap();
    assert!(!token.used);
    assert!(delivery.expires_at > chrono::Utc::now());

    transport.mark_token_used(&delivery.token_id).unwrap();
    let err = transport
        .validate_access_token(&delivery.token_id)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    // The flag never flips back.
    assert!(transport.get_token(&delivery.token_id).unwrap().used);
}

#[test]
fn test_token_expiry_and_default_ttl() {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, _) = package(&packager);
    let mut transport = SecureTransport::new(&VaultConfig::default()).unwrap();
    let now = pkg.metadata.created_at;

    let delivery = transport
        .deliver_package_at(&pkg, DeliveryOptions::portal(), now)
        .unwrap();
    assert_eq!(delivery.expires_at, now + Duration::minutes(60));

    let err = transport
        .validate_access_token_at(&delivery.token_id, delivery.expires_at)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    assert_eq!(
        transport.validate_access_token("unknown").unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn test_expired_package_is_not_delivered() {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let (pkg, _) = package(&packager);
    let mut transport = SecureTransport::new(&VaultConfig::default()).unwrap();

    let err = transport
        .deliver_package_at(
            &pkg,
            DeliveryOptions::portal(),
            pkg.metadata.expires_at + Duration::seconds(1),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Expired);
    assert!(transport.tokens_for_package(&pkg.package_id).is_empty());
}
