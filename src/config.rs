//! Vault configuration.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Configuration shared by every vault component.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the salt, sealed signing key, documents and
    /// state snapshots.
    pub root: PathBuf,

    /// PBKDF2 rounds for deriving the master key from the owner passphrase.
    pub master_kdf_iterations: u32,

    /// PBKDF2 rounds for user passphrase hashes in the auth store.
    pub passphrase_kdf_iterations: u32,

    /// Lifetime of an authentication session.
    pub session_ttl_hours: i64,

    /// Prefix of every access URL (`{base_url}/vault/access/{token_id}`).
    pub base_url: String,

    /// Default lifetime of an access token when delivery options omit one.
    pub token_ttl_minutes: i64,

    /// Default lifetime of a data package.
    pub package_ttl_hours: i64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".datavault"),
            master_kdf_iterations: 600_000,
            passphrase_kdf_iterations: 210_000,
            session_ttl_hours: 24,
            base_url: "https://localhost:3000".to_string(),
            token_ttl_minutes: 60,
            package_ttl_hours: 24,
        }
    }
}

impl VaultConfig {
    /// Default settings rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Cheap KDF settings so tests and benches do not spend seconds per open.
    pub fn for_testing(root: impl AsRef<Path>) -> Self {
        Self {
            master_kdf_iterations: 1_000,
            passphrase_kdf_iterations: 1_000,
            ..Self::new(root)
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let config: Self =
            serde_json::from_slice(&bytes).map_err(|source| VaultError::CorruptState {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> VaultResult<()> {
        if self.master_kdf_iterations == 0 || self.passphrase_kdf_iterations == 0 {
            return Err(VaultError::validation("KDF iteration counts must be non-zero"));
        }
        self.session_ttl()?;
        self.token_ttl()?;
        self.package_ttl()?;
        Ok(())
    }

    pub fn session_ttl(&self) -> VaultResult<Duration> {
        lifetime(Duration::try_hours(self.session_ttl_hours), "session_ttl_hours")
    }

    pub fn token_ttl(&self) -> VaultResult<Duration> {
        lifetime(Duration::try_minutes(self.token_ttl_minutes), "token_ttl_minutes")
    }

    pub fn package_ttl(&self) -> VaultResult<Duration> {
        lifetime(Duration::try_hours(self.package_ttl_hours), "package_ttl_hours")
    }

    pub(crate) fn documents_dir(&self) -> PathBuf {
        self.root.join("documents")
    }

    pub(crate) fn salt_path(&self) -> PathBuf {
        self.root.join("vault.salt")
    }

    pub(crate) fn verify_path(&self) -> PathBuf {
        self.root.join("vault.verify")
    }

    pub(crate) fn signing_key_path(&self) -> PathBuf {
        self.root.join("signing.key")
    }

    pub(crate) fn auth_path(&self) -> PathBuf {
        self.root.join("auth.json")
    }

    pub(crate) fn workflow_path(&self) -> PathBuf {
        self.root.join("workflow.json")
    }

    pub(crate) fn permissions_path(&self) -> PathBuf {
        self.root.join("permissions.json")
    }

    pub(crate) fn tokens_path(&self) -> PathBuf {
        self.root.join("tokens.json")
    }
}

fn lifetime(ttl: Option<Duration>, key: &str) -> VaultResult<Duration> {
    ttl.filter(|ttl| *ttl > Duration::zero())
        .ok_or_else(|| VaultError::validation(format!("{key} must be positive and in range")))
}
