//! Secure transport.
//!
//! Delivery mints a one-time [`AccessToken`] for a package and an access URL
//! of the form `{base_url}/vault/access/{token_id}`. The URL carries only the
//! token id; key material is handed back to the caller, never to a channel.
//!
//! Channel integrations (email, API, messaging) plug in through
//! [`DeliveryChannel`]. With no channel registered for a method, delivery
//! degrades to the portal artifact.
//!
//! Tokens carry key material, so an opened transport keeps them in
//! `tokens.json` as a single blob sealed under a vault purpose key.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::keys::{DerivedKey, SymmetricKey};
use crate::package::DataPackage;
use crate::persist;
use crate::store::SealedBlob;

const TOKENS_AAD: &[u8] = b"datavault access tokens";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeliveryMethod {
    Portal,
    Email { address: String },
    Api { endpoint: String },
    Messaging { handle: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryKind {
    Portal,
    Email,
    Api,
    Messaging,
}

impl DeliveryMethod {
    pub fn kind(&self) -> DeliveryKind {
        match self {
            Self::Portal => DeliveryKind::Portal,
            Self::Email { .. } => DeliveryKind::Email,
            Self::Api { .. } => DeliveryKind::Api,
            Self::Messaging { .. } => DeliveryKind::Messaging,
        }
    }

    fn validate(&self) -> VaultResult<()> {
        let target = match self {
            Self::Portal => return Ok(()),
            Self::Email { address } => address,
            Self::Api { endpoint } => endpoint,
            Self::Messaging { handle } => handle,
        };
        if target.trim().is_empty() {
            return Err(VaultError::validation(format!(
                "{:?} delivery needs a target",
                self.kind()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub method: DeliveryMethod,
    /// Token lifetime. `None` takes the configured default.
    pub expiration_minutes: Option<i64>,
}

impl DeliveryOptions {
    pub fn portal() -> Self {
        Self {
            method: DeliveryMethod::Portal,
            expiration_minutes: None,
        }
    }

    pub fn with_expiration_minutes(mut self, minutes: i64) -> Self {
        self.expiration_minutes = Some(minutes);
        self
    }
}

impl From<DeliveryMethod> for DeliveryOptions {
    fn from(method: DeliveryMethod) -> Self {
        Self {
            method,
            expiration_minutes: None,
        }
    }
}

/// Grants one retrieval of one package.
#[derive(Clone)]
pub struct AccessToken {
    pub token_id: String,
    pub package_id: String,
    pub recipient: String,
    pub encryption_key: SymmetricKey,
    pub expires_at: DateTime<Utc>,
    pub one_time_use: bool,
    /// One-way: once set it is never cleared.
    pub used: bool,
}

impl AccessToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token_id", &self.token_id)
            .field("package_id", &self.package_id)
            .field("recipient", &self.recipient)
            .field("expires_at", &self.expires_at)
            .field("one_time_use", &self.one_time_use)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// What a channel is allowed to see: no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryArtifact {
    pub token_id: String,
    pub package_id: String,
    pub recipient: String,
    pub access_url: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// Result of a delivery, returned to the owner.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token_id: String,
    pub package_id: String,
    pub access_url: String,
    /// Token key material, handed over out of band.
    pub access_key: SymmetricKey,
    pub expires_at: DateTime<Utc>,
    pub method: DeliveryMethod,
    /// Whether a registered channel sent the artifact.
    pub dispatched: bool,
}

/// An outbound integration for one delivery method.
pub trait DeliveryChannel: Send {
    fn kind(&self) -> DeliveryKind;

    fn dispatch(&mut self, method: &DeliveryMethod, artifact: &DeliveryArtifact) -> VaultResult<()>;
}

type Tokens = HashMap<String, AccessToken>;

/// Persisted form of an [`AccessToken`]. Only ever written inside a
/// [`SealedBlob`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRecord {
    token_id: String,
    package_id: String,
    recipient: String,
    encryption_key: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
    one_time_use: bool,
    used: bool,
}

impl TokenRecord {
    fn from_token(token: &AccessToken) -> Self {
        Self {
            token_id: token.token_id.clone(),
            package_id: token.package_id.clone(),
            recipient: token.recipient.clone(),
            encryption_key: token.encryption_key.to_base64(),
            expires_at: token.expires_at,
            one_time_use: token.one_time_use,
            used: token.used,
        }
    }

    fn to_token(&self) -> VaultResult<AccessToken> {
        Ok(AccessToken {
            token_id: self.token_id.clone(),
            package_id: self.package_id.clone(),
            recipient: self.recipient.clone(),
            encryption_key: SymmetricKey::from_base64(&self.encryption_key)?,
            expires_at: self.expires_at,
            one_time_use: self.one_time_use,
            used: self.used,
        })
    }
}

impl Drop for TokenRecord {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
    }
}

/// Where an opened transport keeps its tokens.
struct TokenFile {
    path: PathBuf,
    key: DerivedKey,
}

impl TokenFile {
    fn load(&self) -> VaultResult<Tokens> {
        let Some(blob) = persist::read_json::<SealedBlob>(&self.path)? else {
            return Ok(HashMap::new());
        };
        let plaintext = Zeroizing::new(blob.open(self.key.as_bytes(), TOKENS_AAD)?);
        let records: Vec<TokenRecord> = serde_json::from_slice(&plaintext)?;
        let mut tokens = HashMap::with_capacity(records.len());
        for record in &records {
            tokens.insert(record.token_id.clone(), record.to_token()?);
        }
        Ok(tokens)
    }

    fn save(&self, tokens: &Tokens) -> VaultResult<()> {
        let records: Vec<TokenRecord> = tokens.values().map(TokenRecord::from_token).collect();
        let plaintext = Zeroizing::new(serde_json::to_vec(&records)?);
        let blob = SealedBlob::seal(self.key.as_bytes(), &plaintext, TOKENS_AAD)?;
        persist::write_json_atomic(&self.path, &blob)
    }
}

pub struct SecureTransport {
    base_url: String,
    default_ttl: Duration,
    tokens: Tokens,
    channels: HashMap<DeliveryKind, Box<dyn DeliveryChannel>>,
    file: Option<TokenFile>,
}

impl SecureTransport {
    /// A transport whose tokens live only as long as it does.
    pub fn new(config: &VaultConfig) -> VaultResult<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_ttl: config.token_ttl()?,
            tokens: HashMap::new(),
            channels: HashMap::new(),
            file: None,
        })
    }

    /// Load tokens from `tokens.json` under the config root, sealed with
    /// `sealing_key`. A missing file is an empty token set.
    pub(crate) fn open(config: &VaultConfig, sealing_key: DerivedKey) -> VaultResult<Self> {
        let file = TokenFile {
            path: config.tokens_path(),
            key: sealing_key,
        };
        let mut transport = Self::new(config)?;
        transport.tokens = file.load()?;
        transport.file = Some(file);
        debug!(tokens = transport.tokens.len(), "access tokens loaded");
        Ok(transport)
    }

    /// Apply `change` to a copy of the tokens and swap it in once sealed
    /// to disk.
    fn commit<T>(&mut self, change: impl FnOnce(&mut Tokens) -> VaultResult<T>) -> VaultResult<T> {
        let mut next = self.tokens.clone();
        let out = change(&mut next)?;
        if let Some(file) = &self.file {
            file.save(&next)?;
        }
        self.tokens = next;
        Ok(out)
    }

    /// Route deliveries of the channel's kind through it. Replaces any
    /// channel already registered for that kind.
    pub fn register_channel(&mut self, channel: Box<dyn DeliveryChannel>) {
        let kind = channel.kind();
        debug!(?kind, "delivery channel registered");
        self.channels.insert(kind, channel);
    }

    pub fn access_url(&self, token_id: &str) -> String {
        format!("{}/vault/access/{token_id}", self.base_url)
    }

    pub fn deliver_package(
        &mut self,
        package: &DataPackage,
        options: DeliveryOptions,
    ) -> VaultResult<Delivery> {
        self.deliver_package_at(package, options, crate::now_millis())
    }

    /// Mint a token for `package`. The token never outlives the package.
    ///
    /// The token is stored before any channel sees the artifact; if the
    /// channel fails the token is withdrawn again.
    pub fn deliver_package_at(
        &mut self,
        package: &DataPackage,
        options: DeliveryOptions,
        now: DateTime<Utc>,
    ) -> VaultResult<Delivery> {
        if package.is_expired_at(now) {
            return Err(VaultError::Expired(format!("package {}", package.package_id)));
        }
        options.method.validate()?;
        let ttl = match options.expiration_minutes {
            Some(minutes) => Duration::try_minutes(minutes)
                .ok_or_else(|| VaultError::validation("token lifetime is out of range"))?,
            None => self.default_ttl,
        };
        let expires_at = crate::expiry(now, ttl, "token")?.min(package.metadata.expires_at);

        let token = AccessToken {
            token_id: Uuid::new_v4().to_string(),
            package_id: package.package_id.clone(),
            recipient: package.recipient.clone(),
            encryption_key: SymmetricKey::generate()?,
            expires_at,
            one_time_use: package.metadata.one_time_use,
            used: false,
        };
        let artifact = DeliveryArtifact {
            token_id: token.token_id.clone(),
            package_id: token.package_id.clone(),
            recipient: token.recipient.clone(),
            access_url: self.access_url(&token.token_id),
            expires_at: token.expires_at,
        };
        let access_key = token.encryption_key.clone();
        self.commit(|tokens| {
            tokens.insert(token.token_id.clone(), token);
            Ok(())
        })?;

        let kind = options.method.kind();
        let sent = match self.channels.get_mut(&kind) {
            Some(channel) if kind != DeliveryKind::Portal => {
                Some(channel.dispatch(&options.method, &artifact))
            }
            _ => {
                if kind != DeliveryKind::Portal {
                    debug!(?kind, "no channel registered, falling back to portal");
                }
                None
            }
        };
        let dispatched = match sent {
            Some(Err(err)) => {
                if let Err(cleanup) = self.revoke_access_token(&artifact.token_id) {
                    warn!(token_id = %artifact.token_id, error = %cleanup, "could not withdraw undelivered token");
                }
                return Err(err);
            }
            Some(Ok(())) => true,
            None => false,
        };

        let delivery = Delivery {
            token_id: artifact.token_id,
            package_id: artifact.package_id,
            access_url: artifact.access_url,
            access_key,
            expires_at: artifact.expires_at,
            method: options.method,
            dispatched,
        };
        info!(
            token_id = %delivery.token_id,
            package_id = %delivery.package_id,
            ?kind,
            dispatched,
            "package delivered"
        );
        Ok(delivery)
    }

    pub fn validate_access_token(&self, token_id: &str) -> VaultResult<&AccessToken> {
        self.validate_access_token_at(token_id, Utc::now())
    }

    pub fn validate_access_token_at(
        &self,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> VaultResult<&AccessToken> {
        let token = self
            .tokens
            .get(token_id)
            .ok_or_else(|| VaultError::not_found("access token", token_id))?;
        if token.is_expired_at(now) {
            return Err(VaultError::Expired(format!("access token {token_id}")));
        }
        if token.used {
            warn!(token_id, "reuse of consumed access token");
            return Err(VaultError::StateConflict(format!(
                "access token {token_id} already used"
            )));
        }
        Ok(token)
    }

    /// Validate the token and check that the presenter holds its key.
    pub fn authorize_access(
        &self,
        token_id: &str,
        access_key: &SymmetricKey,
    ) -> VaultResult<&AccessToken> {
        self.authorize_access_at(token_id, access_key, Utc::now())
    }

    pub fn authorize_access_at(
        &self,
        token_id: &str,
        access_key: &SymmetricKey,
        now: DateTime<Utc>,
    ) -> VaultResult<&AccessToken> {
        let token = self.validate_access_token_at(token_id, now)?;
        if !token.encryption_key.matches(access_key) {
            warn!(token_id, "access key mismatch");
            return Err(VaultError::AuthFailure(format!(
                "wrong key for access token {token_id}"
            )));
        }
        Ok(token)
    }

    pub fn mark_token_used(&mut self, token_id: &str) -> VaultResult<()> {
        self.commit(|tokens| {
            let token = tokens
                .get_mut(token_id)
                .ok_or_else(|| VaultError::not_found("access token", token_id))?;
            token.used = true;
            Ok(())
        })?;
        debug!(token_id, "access token consumed");
        Ok(())
    }

    /// Remove a token outright. Returns whether it existed.
    pub fn revoke_access_token(&mut self, token_id: &str) -> VaultResult<bool> {
        if !self.tokens.contains_key(token_id) {
            return Ok(false);
        }
        self.commit(|tokens| {
            tokens.remove(token_id);
            Ok(())
        })?;
        info!(token_id, "access token revoked");
        Ok(true)
    }

    pub fn cleanup_expired_tokens(&mut self) -> VaultResult<usize> {
        self.cleanup_expired_tokens_at(Utc::now())
    }

    /// Drop expired and used tokens.
    pub fn cleanup_expired_tokens_at(&mut self, now: DateTime<Utc>) -> VaultResult<usize> {
        let live = |t: &AccessToken| !t.used && !t.is_expired_at(now);
        let removed = self.tokens.values().filter(|&t| !live(t)).count();
        if removed == 0 {
            return Ok(0);
        }
        self.commit(|tokens| {
            tokens.retain(|_, t| live(&*t));
            Ok(())
        })?;
        debug!(removed, "access tokens swept");
        Ok(removed)
    }

    pub fn get_token(&self, token_id: &str) -> Option<&AccessToken> {
        self.tokens.get(token_id)
    }

    pub fn tokens_for_package(&self, package_id: &str) -> Vec<&AccessToken> {
        self.tokens
            .values()
            .filter(|t| t.package_id == package_id)
            .collect()
    }
}

impl fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureTransport")
            .field("base_url", &self.base_url)
            .field("tokens", &self.tokens.len())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("persisted", &self.file.is_some())
            .finish()
    }
}
