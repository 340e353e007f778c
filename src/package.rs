//! Data packager.
//!
//! Turns approved data into a [`DataPackage`]: the payload is filtered down to
//! the approved fields, optionally watermarked, sealed with AES-256-GCM under a
//! fresh package key (AAD = package id), and every non-secret field is signed
//! with the vault's Ed25519 key. The package key travels out of band.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::encoding::{self, base64_bytes};
use crate::error::{VaultError, VaultResult};
use crate::keys::{PackageKey, SigningKey};
use crate::permissions::WILDCARD_FIELD;

/// Key under which the watermark is injected into the payload.
pub const WATERMARK_KEY: &str = "_watermark";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub one_time_use: bool,
    pub watermarked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPackage {
    pub package_id: String,
    pub request_id: String,
    pub recipient: String,
    pub category: String,
    pub fields: Vec<String>,
    #[serde(rename = "encryptedData", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub metadata: PackageMetadata,
}

impl DataPackage {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.metadata.expires_at
    }

    /// Canonical bytes covered by the signature: every field except the
    /// signature itself, in a fixed order.
    pub fn signed_bytes(&self) -> VaultResult<Vec<u8>> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Signed<'a> {
            package_id: &'a str,
            request_id: &'a str,
            recipient: &'a str,
            category: &'a str,
            fields: &'a [String],
            encrypted_data: String,
            iv: String,
            auth_tag: String,
            metadata: &'a PackageMetadata,
        }

        let view = Signed {
            package_id: &self.package_id,
            request_id: &self.request_id,
            recipient: &self.recipient,
            category: &self.category,
            fields: &self.fields,
            encrypted_data: encoding::encode(&self.ciphertext),
            iv: encoding::encode(&self.iv),
            auth_tag: encoding::encode(&self.auth_tag),
            metadata: &self.metadata,
        };
        Ok(serde_json::to_vec(&view)?)
    }
}

/// Traceability marker injected into a delivered payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub package_id: String,
    pub recipient: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Hex SHA-256 of `"{packageId}:{recipient}:{timestamp}"`.
    pub hash: String,
}

impl Watermark {
    fn binding(package_id: &str, recipient: &str, timestamp: i64) -> String {
        hex::encode(crypto::sha256(
            format!("{package_id}:{recipient}:{timestamp}").as_bytes(),
        ))
    }

    pub fn new(package_id: &str, recipient: &str, at: DateTime<Utc>) -> Self {
        let timestamp = at.timestamp_millis();
        Self {
            package_id: package_id.to_string(),
            recipient: recipient.to_string(),
            timestamp,
            hash: Self::binding(package_id, recipient, timestamp),
        }
    }

    /// Extract the watermark from a decrypted payload, if present.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        payload
            .get(WATERMARK_KEY)
            .and_then(|w| serde_json::from_value(w.clone()).ok())
    }

    /// Whether the hash still binds the other three fields.
    pub fn is_consistent(&self) -> bool {
        self.hash == Self::binding(&self.package_id, &self.recipient, self.timestamp)
    }
}

pub struct PackageOptions {
    /// Lifetime of the package. `None` takes the packager default.
    pub expires_in: Option<Duration>,
    pub one_time_use: bool,
    pub watermark: bool,
    /// Use this key instead of generating one.
    pub encryption_key: Option<PackageKey>,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            expires_in: None,
            one_time_use: true,
            watermark: true,
            encryption_key: None,
        }
    }
}

impl fmt::Debug for PackageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageOptions")
            .field("expires_in", &self.expires_in)
            .field("one_time_use", &self.one_time_use)
            .field("watermark", &self.watermark)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Reduce `data` to `fields`. A wildcard passes everything through;
/// otherwise `data` must be an object and missing fields are skipped.
fn filter_fields(data: &Value, fields: &[String]) -> VaultResult<Value> {
    if fields.iter().any(|f| f == WILDCARD_FIELD) {
        return Ok(data.clone());
    }
    let object = data
        .as_object()
        .ok_or_else(|| VaultError::validation("package payload must be a JSON object"))?;
    let filtered: Map<String, Value> = fields
        .iter()
        .filter_map(|f| object.get(f).map(|v| (f.clone(), v.clone())))
        .collect();
    Ok(Value::Object(filtered))
}

pub struct DataPackager {
    signing_key: SigningKey,
    default_ttl: Duration,
}

impl DataPackager {
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            signing_key,
            default_ttl: Duration::hours(24),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Base64 Ed25519 key recipients use to verify packages.
    pub fn public_key(&self) -> String {
        self.signing_key.public_key_base64()
    }

    pub fn create_package(
        &self,
        request_id: &str,
        recipient: &str,
        category: &str,
        fields: &[String],
        data: &Value,
        options: PackageOptions,
    ) -> VaultResult<(DataPackage, PackageKey)> {
        self.create_package_at(
            request_id,
            recipient,
            category,
            fields,
            data,
            options,
            crate::now_millis(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_package_at(
        &self,
        request_id: &str,
        recipient: &str,
        category: &str,
        fields: &[String],
        data: &Value,
        options: PackageOptions,
        now: DateTime<Utc>,
    ) -> VaultResult<(DataPackage, PackageKey)> {
        if request_id.is_empty() || recipient.is_empty() || category.is_empty() {
            return Err(VaultError::validation(
                "request id, recipient and category are required",
            ));
        }
        if fields.is_empty() {
            return Err(VaultError::validation("at least one field is required"));
        }
        let ttl = options.expires_in.unwrap_or(self.default_ttl);
        let expires_at = crate::expiry(now, ttl, "package")?;

        let package_id = Uuid::new_v4().to_string();
        let mut payload = filter_fields(data, fields)?;
        if options.watermark {
            let object = payload.as_object_mut().ok_or_else(|| {
                VaultError::validation("watermarking requires a JSON object payload")
            })?;
            let watermark = Watermark::new(&package_id, recipient, now);
            object.insert(WATERMARK_KEY.to_string(), serde_json::to_value(watermark)?);
        }

        let key = match options.encryption_key {
            Some(key) => key,
            None => PackageKey::generate()?,
        };
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&payload)?);
        let sealed = crypto::encrypt(key.as_bytes(), &plaintext, package_id.as_bytes())?;

        let mut package = DataPackage {
            package_id,
            request_id: request_id.to_string(),
            recipient: recipient.to_string(),
            category: category.to_string(),
            fields: fields.to_vec(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
            signature: Vec::new(),
            metadata: PackageMetadata {
                created_at: now,
                expires_at,
                one_time_use: options.one_time_use,
                watermarked: options.watermark,
            },
        };
        package.signature = self.signing_key.sign(&package.signed_bytes()?);

        info!(
            package_id = %package.package_id,
            request_id,
            recipient,
            category,
            "package created"
        );
        Ok((package, key))
    }

    pub fn verify_package(&self, package: &DataPackage) -> bool {
        verify_signature(&self.signing_key.public_key(), package)
    }

    pub fn is_package_valid(&self, package: &DataPackage) -> bool {
        self.is_package_valid_at(package, Utc::now())
    }

    /// Not expired and signed by this vault.
    pub fn is_package_valid_at(&self, package: &DataPackage, now: DateTime<Utc>) -> bool {
        !package.is_expired_at(now) && self.verify_package(package)
    }

    pub fn decrypt_package(&self, package: &DataPackage, key: &PackageKey) -> VaultResult<Value> {
        self.decrypt_package_at(package, key, Utc::now())
    }

    pub fn decrypt_package_at(
        &self,
        package: &DataPackage,
        key: &PackageKey,
        now: DateTime<Utc>,
    ) -> VaultResult<Value> {
        open_package(&self.signing_key.public_key(), package, key, now)
    }
}

impl fmt::Debug for DataPackager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPackager")
            .field("public_key", &self.public_key())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn verify_signature(public_key: &[u8], package: &DataPackage) -> bool {
    match package.signed_bytes() {
        Ok(bytes) => crypto::verify_signature(public_key, &bytes, &package.signature),
        Err(_) => false,
    }
}

fn open_package(
    public_key: &[u8],
    package: &DataPackage,
    key: &PackageKey,
    now: DateTime<Utc>,
) -> VaultResult<Value> {
    if package.is_expired_at(now) {
        return Err(VaultError::Expired(format!("package {}", package.package_id)));
    }
    if !verify_signature(public_key, package) {
        warn!(package_id = %package.package_id, "package signature rejected");
        return Err(VaultError::IntegrityFailure);
    }

    let plaintext = zeroize::Zeroizing::new(crypto::decrypt(
        key.as_bytes(),
        &package.ciphertext,
        &package.iv,
        &package.auth_tag,
        package.package_id.as_bytes(),
    )?);
    let payload = serde_json::from_slice(&plaintext).map_err(|_| VaultError::IntegrityFailure)?;

    debug!(package_id = %package.package_id, "package decrypted");
    Ok(payload)
}

/// Signature check for holders of the vault's base64 public key only.
pub fn verify_package_with(public_key_b64: &str, package: &DataPackage) -> bool {
    encoding::decode(public_key_b64)
        .map(|key| verify_signature(&key, package))
        .unwrap_or(false)
}

/// Recipient-side open: expiry, signature, then AEAD.
pub fn decrypt_package_with(
    public_key_b64: &str,
    package: &DataPackage,
    key: &PackageKey,
    now: DateTime<Utc>,
) -> VaultResult<Value> {
    let public_key = encoding::decode(public_key_b64).map_err(|_| VaultError::InvalidKey)?;
    open_package(&public_key, package, key, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packager() -> DataPackager {
        DataPackager::new(SigningKey::generate().unwrap())
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn record() -> Value {
        json!({
            "name": "John Doe",
            "bloodType": "O+",
            "ssn": "000-00-0000",
        })
    }

    #[test]
    fn payload_is_filtered_and_watermarked() {
        let packager = packager();
        let (pkg, key) = packager
            .create_package(
                "r1",
                "clinic-7",
                "medical",
                &fields(&["name", "bloodType"]),
                &record(),
                PackageOptions::default(),
            )
            .unwrap();

        let payload = packager.decrypt_package(&pkg, &key).unwrap();
        assert_eq!(payload["name"], "John Doe");
        assert!(payload.get("ssn").is_none());

        let watermark = Watermark::from_payload(&payload).unwrap();
        assert_eq!(watermark.package_id, pkg.package_id);
        assert_eq!(watermark.recipient, "clinic-7");
        assert!(watermark.is_consistent());
    }

    #[test]
    fn wildcard_passes_everything() {
        let packager = packager();
        let options = PackageOptions {
            watermark: false,
            ..Default::default()
        };
        let (pkg, key) = packager
            .create_package("r1", "clinic-7", "medical", &fields(&["*"]), &record(), options)
            .unwrap();
        assert_eq!(packager.decrypt_package(&pkg, &key).unwrap(), record());
        assert!(!pkg.metadata.watermarked);
    }

    #[test]
    fn non_object_payload_needs_wildcard() {
        let packager = packager();
        let err = packager
            .create_package(
                "r1",
                "clinic-7",
                "medical",
                &fields(&["name"]),
                &json!(["a", "b"]),
                PackageOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn caller_supplied_key_is_used() {
        let packager = packager();
        let key = PackageKey::generate().unwrap();
        let options = PackageOptions {
            encryption_key: Some(key.clone()),
            ..Default::default()
        };
        let (pkg, returned) = packager
            .create_package("r1", "clinic-7", "medical", &fields(&["name"]), &record(), options)
            .unwrap();
        assert_eq!(returned, key);
        assert!(packager.decrypt_package(&pkg, &key).is_ok());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let packager = packager();
        let (pkg, _) = packager
            .create_package(
                "r1",
                "clinic-7",
                "medical",
                &fields(&["name"]),
                &record(),
                PackageOptions::default(),
            )
            .unwrap();
        let other = PackageKey::generate().unwrap();
        assert!(matches!(
            packager.decrypt_package(&pkg, &other),
            Err(VaultError::IntegrityFailure)
        ));
    }

    #[test]
    fn other_vault_key_does_not_verify() {
        let ours = packager();
        let theirs = packager();
        let (pkg, _) = ours
            .create_package(
                "r1",
                "clinic-7",
                "medical",
                &fields(&["name"]),
                &record(),
                PackageOptions::default(),
            )
            .unwrap();
        assert!(verify_package_with(&ours.public_key(), &pkg));
        assert!(!verify_package_with(&theirs.public_key(), &pkg));
        assert!(!verify_package_with("not base64!", &pkg));
    }

    #[test]
    fn unrepresentable_lifetime_rejected() {
        let packager = packager();
        for ttl in [Duration::MAX, Duration::zero()] {
            let options = PackageOptions {
                expires_in: Some(ttl),
                ..Default::default()
            };
            let err = packager
                .create_package("r1", "clinic-7", "medical", &fields(&["name"]), &record(), options)
                .unwrap_err();
            assert!(matches!(err, VaultError::Validation(_)));
        }
    }
}
