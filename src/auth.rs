//! Authentication manager.
//!
//! Issues and validates time-bound sessions from one or more factors and
//! manages each user's enrolled devices. State is a map from user id to
//! [`StoredAuth`], persisted to `auth.json` after every mutation.
//!
//! Passphrase alone never yields a session for a user with MFA enabled:
//! [`AuthManager::authenticate`] answers [`VaultError::MfaRequired`] and the
//! caller must go through [`AuthManager::authenticate_mfa`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::crypto::{self, SALT_LEN};
use crate::encoding::{self, base64_bytes};
use crate::error::{VaultError, VaultResult};
use crate::keys;
use crate::persist;

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

/// One authentication factor presented by a caller.
#[derive(Clone)]
pub enum AuthFactor {
    Passphrase { value: String },
    /// Base64 Ed25519 signature over the UTF-8 device id, made with the
    /// device's enrolled key.
    Device { device_id: String, signature: String },
    Biometric { token: String },
    HardwareKey { challenge: String, response: String },
}

impl AuthFactor {
    pub fn passphrase(value: impl Into<String>) -> Self {
        Self::Passphrase {
            value: value.into(),
        }
    }

    pub fn device(device_id: impl Into<String>, signature: impl Into<String>) -> Self {
        Self::Device {
            device_id: device_id.into(),
            signature: signature.into(),
        }
    }

    pub fn kind(&self) -> FactorKind {
        match self {
            Self::Passphrase { .. } => FactorKind::Passphrase,
            Self::Device { .. } => FactorKind::Device,
            Self::Biometric { .. } => FactorKind::Biometric,
            Self::HardwareKey { .. } => FactorKind::HardwareKey,
        }
    }
}

impl fmt::Debug for AuthFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { device_id, .. } => f
                .debug_struct("Device")
                .field("device_id", device_id)
                .finish_non_exhaustive(),
            other => write!(f, "{:?}(..)", other.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactorKind {
    Passphrase,
    Device,
    Biometric,
    HardwareKey,
}

/// Checks the factors that need a platform integration.
///
/// Implement this to plug in a real biometric or FIDO2 verifier.
pub trait FactorVerifier: Send {
    fn verify_biometric(&self, user_id: &str, token: &str) -> bool;
    fn verify_hardware_key(&self, user_id: &str, challenge: &str, response: &str) -> bool;
}

/// Accepts any non-empty biometric token or hardware-key response.
///
/// Not a security guarantee: replace it with a real verifier before
/// trusting these factors.
#[derive(Debug, Default)]
pub struct PlaceholderVerifier;

impl FactorVerifier for PlaceholderVerifier {
    fn verify_biometric(&self, user_id: &str, token: &str) -> bool {
        warn!(user_id, "biometric factor checked by placeholder verifier");
        !token.is_empty()
    }

    fn verify_hardware_key(&self, user_id: &str, challenge: &str, response: &str) -> bool {
        warn!(user_id, "hardware-key factor checked by placeholder verifier");
        !challenge.is_empty() && !response.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stored state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedDevice {
    pub device_id: String,
    pub name: String,
    /// Base64 raw Ed25519 public key.
    pub public_key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub session_id: String,
    pub user_id: String,
    pub factors: Vec<FactorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuth {
    pub user_id: String,
    #[serde(with = "base64_bytes")]
    pub passphrase_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    /// PBKDF2 rounds the hash was made with. Verification always uses this,
    /// not the current config.
    pub kdf_iterations: u32,
    pub mfa_enabled: bool,
    #[serde(default)]
    pub authorized_devices: Vec<AuthorizedDevice>,
    #[serde(default)]
    pub sessions: Vec<AuthSession>,
}

type Users = HashMap<String, StoredAuth>;

fn user_entry<'a>(users: &'a mut Users, user_id: &str) -> VaultResult<&'a mut StoredAuth> {
    users
        .get_mut(user_id)
        .ok_or_else(|| VaultError::not_found("user", user_id))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct AuthManager {
    path: Option<PathBuf>,
    users: Users,
    session_ttl: Duration,
    kdf_iterations: u32,
    verifier: Box<dyn FactorVerifier>,
}

impl AuthManager {
    /// Load `auth.json` under the config root. A missing file is an empty
    /// store; a corrupt one is an error.
    pub fn open(config: &VaultConfig) -> VaultResult<Self> {
        let path = config.auth_path();
        let users: Users = persist::read_json(&path)?.unwrap_or_default();
        let mut manager = Self::in_memory(config)?;
        manager.users = users;
        manager.path = Some(path);
        debug!(users = manager.users.len(), "auth store loaded");
        Ok(manager)
    }

    /// A manager that never touches disk.
    pub fn in_memory(config: &VaultConfig) -> VaultResult<Self> {
        if config.passphrase_kdf_iterations == 0 {
            return Err(VaultError::validation("KDF iteration count must be non-zero"));
        }
        Ok(Self {
            path: None,
            users: HashMap::new(),
            session_ttl: config.session_ttl()?,
            kdf_iterations: config.passphrase_kdf_iterations,
            verifier: Box::new(PlaceholderVerifier),
        })
    }

    /// Replace the biometric/hardware-key verifier.
    pub fn with_verifier(mut self, verifier: Box<dyn FactorVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Apply `change` to a copy of the user map. The copy replaces the live
    /// map only once it is on disk, so a failed write changes nothing.
    fn commit<T>(&mut self, change: impl FnOnce(&mut Users) -> VaultResult<T>) -> VaultResult<T> {
        let mut next = self.users.clone();
        let out = change(&mut next)?;
        if let Some(path) = &self.path {
            persist::write_json_atomic(path, &next)?;
        }
        self.users = next;
        Ok(out)
    }

    fn user(&self, user_id: &str) -> VaultResult<&StoredAuth> {
        self.users
            .get(user_id)
            .ok_or_else(|| VaultError::not_found("user", user_id))
    }

    pub fn user_exists(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn is_mfa_enabled(&self, user_id: &str) -> VaultResult<bool> {
        Ok(self.user(user_id)?.mfa_enabled)
    }

    /// Register a user and open their first single-factor session.
    pub fn create_user(
        &mut self,
        user_id: &str,
        passphrase: &str,
        mfa_enabled: bool,
    ) -> VaultResult<AuthSession> {
        if user_id.is_empty() {
            return Err(VaultError::validation("user id must not be empty"));
        }
        if passphrase.is_empty() {
            return Err(VaultError::validation("passphrase must not be empty"));
        }
        if self.users.contains_key(user_id) {
            return Err(VaultError::StateConflict(format!(
                "user already exists: {user_id}"
            )));
        }

        let salt = crypto::random_bytes(SALT_LEN)?;
        let hash = keys::hash_passphrase(passphrase, &salt, self.kdf_iterations)?;
        let session = self.new_session(user_id, vec![FactorKind::Passphrase], None)?;
        let stored = StoredAuth {
            user_id: user_id.to_string(),
            passphrase_hash: hash.to_vec(),
            salt,
            kdf_iterations: self.kdf_iterations,
            mfa_enabled,
            authorized_devices: Vec::new(),
            sessions: vec![session.clone()],
        };
        self.commit(|users| {
            users.insert(user_id.to_string(), stored);
            Ok(())
        })?;

        info!(user_id, mfa_enabled, "user created");
        Ok(session)
    }

    /// Remove a user with all their devices and sessions.
    pub fn remove_user(&mut self, user_id: &str) -> VaultResult<()> {
        self.commit(|users| {
            users
                .remove(user_id)
                .map(drop)
                .ok_or_else(|| VaultError::not_found("user", user_id))
        })?;
        info!(user_id, "user removed");
        Ok(())
    }

    pub fn set_mfa_enabled(&mut self, user_id: &str, enabled: bool) -> VaultResult<()> {
        self.commit(|users| {
            user_entry(users, user_id)?.mfa_enabled = enabled;
            Ok(())
        })?;
        info!(user_id, enabled, "mfa setting changed");
        Ok(())
    }

    fn new_session(
        &self,
        user_id: &str,
        factors: Vec<FactorKind>,
        device_id: Option<String>,
    ) -> VaultResult<AuthSession> {
        let created_at = crate::now_millis();
        Ok(AuthSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            factors,
            device_id,
            created_at,
            expires_at: crate::expiry(created_at, self.session_ttl, "session")?,
        })
    }

    fn validate_factor(&self, stored: &StoredAuth, factor: &AuthFactor) -> bool {
        match factor {
            AuthFactor::Passphrase { value } => keys::verify_passphrase(
                value,
                &stored.salt,
                stored.kdf_iterations,
                &stored.passphrase_hash,
            ),
            AuthFactor::Device {
                device_id,
                signature,
            } => {
                let Some(device) = stored
                    .authorized_devices
                    .iter()
                    .find(|d| &d.device_id == device_id)
                else {
                    return false;
                };
                let (Ok(public_key), Ok(signature)) = (
                    encoding::decode(&device.public_key),
                    encoding::decode(signature),
                ) else {
                    return false;
                };
                crypto::verify_signature(&public_key, device_id.as_bytes(), &signature)
            }
            AuthFactor::Biometric { token } => {
                self.verifier.verify_biometric(&stored.user_id, token)
            }
            AuthFactor::HardwareKey {
                challenge,
                response,
            } => self
                .verifier
                .verify_hardware_key(&stored.user_id, challenge, response),
        }
    }

    fn issue_session(
        &mut self,
        user_id: &str,
        factors: Vec<FactorKind>,
        device_id: Option<String>,
    ) -> VaultResult<AuthSession> {
        let session = self.new_session(user_id, factors, device_id)?;
        let issued = session.clone();
        self.commit(|users| {
            user_entry(users, user_id)?.sessions.push(issued);
            Ok(())
        })?;
        info!(user_id, session_id = %session.session_id, factors = ?session.factors, "session issued");
        Ok(session)
    }

    /// Authenticate with a single factor.
    ///
    /// For a user with MFA enabled a valid passphrase fails with
    /// [`VaultError::MfaRequired`]; no session is issued.
    pub fn authenticate(&mut self, user_id: &str, factor: AuthFactor) -> VaultResult<AuthSession> {
        let stored = self.user(user_id)?;

        if !self.validate_factor(stored, &factor) {
            warn!(user_id, factor = ?factor.kind(), "authentication failed");
            return Err(VaultError::AuthFailure(format!(
                "invalid {:?} factor",
                factor.kind()
            )));
        }
        if stored.mfa_enabled && factor.kind() == FactorKind::Passphrase {
            info!(user_id, "passphrase accepted, second factor required");
            return Err(VaultError::MfaRequired);
        }

        let device_id = match &factor {
            AuthFactor::Device { device_id, .. } => Some(device_id.clone()),
            _ => None,
        };
        self.issue_session(user_id, vec![factor.kind()], device_id)
    }

    /// Authenticate with several factors. Every factor must validate; one
    /// failure fails the whole call. With MFA enabled at least two distinct
    /// factor kinds are required.
    pub fn authenticate_mfa(
        &mut self,
        user_id: &str,
        factors: &[AuthFactor],
    ) -> VaultResult<AuthSession> {
        if factors.is_empty() {
            return Err(VaultError::validation("at least one factor is required"));
        }
        let stored = self.user(user_id)?;

        for factor in factors {
            if !self.validate_factor(stored, factor) {
                warn!(user_id, factor = ?factor.kind(), "multi-factor authentication failed");
                return Err(VaultError::AuthFailure(format!(
                    "invalid {:?} factor",
                    factor.kind()
                )));
            }
        }

        let mut kinds = Vec::new();
        let mut seen = HashSet::new();
        for factor in factors {
            if seen.insert(factor.kind()) {
                kinds.push(factor.kind());
            }
        }
        if stored.mfa_enabled && kinds.len() < 2 {
            return Err(VaultError::MfaRequired);
        }

        let device_id = factors.iter().find_map(|f| match f {
            AuthFactor::Device { device_id, .. } => Some(device_id.clone()),
            _ => None,
        });
        self.issue_session(user_id, kinds, device_id)
    }

    /// The session, if it exists and has not expired.
    pub fn validate_session(&self, session_id: &str) -> VaultResult<AuthSession> {
        self.validate_session_at(session_id, Utc::now())
    }

    pub fn validate_session_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<AuthSession> {
        let session = self
            .users
            .values()
            .flat_map(|u| u.sessions.iter())
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| VaultError::not_found("session", session_id))?;

        if !session.is_valid_at(now) {
            return Err(VaultError::Expired(format!("session {session_id}")));
        }
        Ok(session.clone())
    }

    pub fn revoke_session(&mut self, session_id: &str) -> VaultResult<()> {
        let user_id = self.commit(|users| {
            let owner = users
                .values_mut()
                .find(|u| u.sessions.iter().any(|s| s.session_id == session_id))
                .ok_or_else(|| VaultError::not_found("session", session_id))?;
            owner.sessions.retain(|s| s.session_id != session_id);
            Ok(owner.user_id.clone())
        })?;
        info!(user_id = %user_id, session_id, "session revoked");
        Ok(())
    }

    pub fn list_sessions(&self, user_id: &str) -> VaultResult<Vec<AuthSession>> {
        Ok(self.user(user_id)?.sessions.clone())
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn cleanup_expired_sessions(&mut self) -> VaultResult<usize> {
        self.cleanup_expired_sessions_at(Utc::now())
    }

    pub fn cleanup_expired_sessions_at(&mut self, now: DateTime<Utc>) -> VaultResult<usize> {
        let stale = self
            .users
            .values()
            .flat_map(|u| u.sessions.iter())
            .filter(|s| !s.is_valid_at(now))
            .count();
        if stale == 0 {
            return Ok(0);
        }
        self.commit(|users| {
            for user in users.values_mut() {
                user.sessions.retain(|s| s.is_valid_at(now));
            }
            Ok(())
        })?;
        debug!(removed = stale, "expired sessions removed");
        Ok(stale)
    }

    /// Register a device key for the device factor.
    pub fn enroll_device(
        &mut self,
        user_id: &str,
        device_id: &str,
        name: &str,
        public_key: &str,
    ) -> VaultResult<AuthorizedDevice> {
        if device_id.is_empty() {
            return Err(VaultError::validation("device id must not be empty"));
        }
        if encoding::decode(public_key)?.len() != 32 {
            return Err(VaultError::validation("device key must be a 32-byte Ed25519 key"));
        }

        let device = AuthorizedDevice {
            device_id: device_id.to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            enrolled_at: crate::now_millis(),
        };
        let enrolled = device.clone();
        self.commit(|users| {
            let user = user_entry(users, user_id)?;
            if user.authorized_devices.iter().any(|d| d.device_id == device_id) {
                return Err(VaultError::StateConflict(format!(
                    "device already enrolled: {device_id}"
                )));
            }
            user.authorized_devices.push(enrolled);
            Ok(())
        })?;

        info!(user_id, device_id, "device enrolled");
        Ok(device)
    }

    /// Remove a device and every session it opened.
    pub fn revoke_device(&mut self, user_id: &str, device_id: &str) -> VaultResult<()> {
        self.commit(|users| {
            let user = user_entry(users, user_id)?;
            let before = user.authorized_devices.len();
            user.authorized_devices.retain(|d| d.device_id != device_id);
            if user.authorized_devices.len() == before {
                return Err(VaultError::not_found("device", device_id));
            }
            user.sessions
                .retain(|s| s.device_id.as_deref() != Some(device_id));
            Ok(())
        })?;

        info!(user_id, device_id, "device revoked");
        Ok(())
    }

    pub fn devices(&self, user_id: &str) -> VaultResult<&[AuthorizedDevice]> {
        Ok(&self.user(user_id)?.authorized_devices)
    }
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("path", &self.path)
            .field("users", &self.users.len())
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;

    fn manager() -> AuthManager {
        AuthManager::in_memory(&VaultConfig::for_testing("unused")).unwrap()
    }

    #[test]
    fn duplicate_user_rejected() {
        let mut auth = manager();
        auth.create_user("owner", "pw", false).unwrap();
        assert!(matches!(
            auth.create_user("owner", "other", false),
            Err(VaultError::StateConflict(_))
        ));
    }

    #[test]
    fn wrong_passphrase_fails_without_mfa_hint() {
        let mut auth = manager();
        auth.create_user("owner", "pw", true).unwrap();
        let err = auth
            .authenticate("owner", AuthFactor::passphrase("nope"))
            .unwrap_err();
        assert!(matches!(err, VaultError::AuthFailure(_)));
        assert!(!err.requires_mfa());
    }

    #[test]
    fn single_kind_repeated_does_not_satisfy_mfa() {
        let mut auth = manager();
        auth.create_user("owner", "pw", true).unwrap();
        let result = auth.authenticate_mfa(
            "owner",
            &[AuthFactor::passphrase("pw"), AuthFactor::passphrase("pw")],
        );
        assert!(matches!(result, Err(VaultError::MfaRequired)));
    }

    #[test]
    fn placeholder_factors_need_content() {
        let mut auth = manager();
        auth.create_user("owner", "pw", false).unwrap();
        assert!(auth
            .authenticate("owner", AuthFactor::Biometric { token: String::new() })
            .is_err());
        let session = auth
            .authenticate(
                "owner",
                AuthFactor::HardwareKey {
                    challenge: "c".into(),
                    response: "r".into(),
                },
            )
            .unwrap();
        assert_eq!(session.factors, vec![FactorKind::HardwareKey]);
    }

    #[test]
    fn custom_verifier_is_consulted() {
        struct DenyAll;
        impl FactorVerifier for DenyAll {
            fn verify_biometric(&self, _: &str, _: &str) -> bool {
                false
            }
            fn verify_hardware_key(&self, _: &str, _: &str, _: &str) -> bool {
                false
            }
        }

        let mut auth = manager().with_verifier(Box::new(DenyAll));
        auth.create_user("owner", "pw", false).unwrap();
        assert!(auth
            .authenticate("owner", AuthFactor::Biometric { token: "face".into() })
            .is_err());
    }

    #[test]
    fn revoking_device_drops_its_sessions() {
        let mut auth = manager();
        auth.create_user("owner", "pw", false).unwrap();
        let key = SigningKey::generate().unwrap();
        auth.enroll_device("owner", "phone", "Phone", &key.public_key_base64())
            .unwrap();

        let signature = encoding::encode(key.sign(b"phone"));
        let session = auth
            .authenticate("owner", AuthFactor::device("phone", signature))
            .unwrap();
        assert_eq!(session.device_id.as_deref(), Some("phone"));

        auth.revoke_device("owner", "phone").unwrap();
        assert!(auth.validate_session(&session.session_id).is_err());
        assert!(auth.devices("owner").unwrap().is_empty());
    }

    #[test]
    fn failed_write_leaves_users_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::for_testing(dir.path());
        let mut auth = AuthManager::open(&config).unwrap();
        let blocker = dir.path().join(".auth.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(auth.create_user("owner", "pw", false).is_err());
        assert!(!auth.user_exists("owner"));

        std::fs::remove_dir(&blocker).unwrap();
        let session = auth.create_user("owner", "pw", false).unwrap();

        std::fs::create_dir_all(&blocker).unwrap();
        assert!(auth.revoke_session(&session.session_id).is_err());
        assert!(auth.validate_session(&session.session_id).is_ok());
        assert!(auth.set_mfa_enabled("owner", true).is_err());
        assert!(!auth.is_mfa_enabled("owner").unwrap());
    }

    #[test]
    fn passphrase_checked_with_stored_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::for_testing(dir.path());
        config.passphrase_kdf_iterations = 1_000;
        AuthManager::open(&config)
            .unwrap()
            .create_user("owner", "pw", false)
            .unwrap();

        config.passphrase_kdf_iterations = 2_000;
        let mut auth = AuthManager::open(&config).unwrap();
        assert!(auth
            .authenticate("owner", AuthFactor::passphrase("pw"))
            .is_ok());
        assert!(auth
            .authenticate("owner", AuthFactor::passphrase("nope"))
            .is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let factor = AuthFactor::passphrase("hunter2");
        assert!(!format!("{factor:?}").contains("hunter2"));
    }
}
