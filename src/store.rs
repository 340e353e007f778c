//! Encrypted document store.
//!
//! Each document is sealed with AES-256-GCM under its own key, derived from
//! the vault master key and a fresh random per-document salt. Records are
//! JSON files under `documents/{category}/{id}.json`:
//!
//! ```text
//! { id, category, encryptedData, iv, authTag, salt,
//!   metadata: { created, modified, size, version } }
//! ```
//!
//! The master key is derived once from the owner passphrase and the
//! persisted vault salt, held only in memory, and never leaves this type.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::crypto::{self, KEY_LEN, SALT_LEN};
use crate::encoding::base64_bytes;
use crate::error::{VaultError, VaultResult};
use crate::keys::{self, DerivedKey, MasterKey};
use crate::persist;

/// Known plaintext sealed under a master-derived key on first
/// initialization. Opening it again proves the passphrase.
const VERIFICATION_PLAINTEXT: &[u8] = b"datavault-verification-token-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub modified: DateTime<Utc>,
    /// Plaintext size in bytes.
    pub size: usize,
    pub version: u32,
}

/// A document as it sits on disk. Contains no key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedDocument {
    pub id: String,
    pub category: String,
    #[serde(rename = "encryptedData", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    pub metadata: DocumentMetadata,
}

/// Listing entry: identity and metadata only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: String,
    pub category: String,
    pub metadata: DocumentMetadata,
}

/// Sealed blob for small vault-internal secrets (signing key, verification
/// token, access tokens).
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SealedBlob {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

impl SealedBlob {
    pub(crate) fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> VaultResult<Self> {
        let sealed = crypto::encrypt(key, plaintext, aad)?;
        Ok(Self {
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
        })
    }

    pub(crate) fn open(&self, key: &[u8; KEY_LEN], aad: &[u8]) -> VaultResult<Vec<u8>> {
        crypto::decrypt(key, &self.ciphertext, &self.iv, &self.auth_tag, aad)
    }
}

/// Contents of `vault.verify`: the verification token plus the PBKDF2
/// rounds the master key was derived with, so a later change to the
/// configured count does not lock the owner out.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationRecord {
    kdf_iterations: u32,
    #[serde(flatten)]
    token: SealedBlob,
}

/// Reject names that could escape the documents directory.
fn validate_component(kind: &str, value: &str) -> VaultResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
    {
        return Err(VaultError::validation(format!("invalid {kind}: {value:?}")));
    }
    Ok(())
}

pub struct DocumentStore {
    documents_dir: PathBuf,
    salt_path: PathBuf,
    verify_path: PathBuf,
    kdf_iterations: u32,
    master: Option<MasterKey>,
}

impl DocumentStore {
    /// Create a store rooted at the config's documents directory. Call
    /// [`initialize`](Self::initialize) before storing or retrieving.
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            documents_dir: config.documents_dir(),
            salt_path: config.salt_path(),
            verify_path: config.verify_path(),
            kdf_iterations: config.master_kdf_iterations,
            master: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.master.is_some()
    }

    /// Derive and hold the master key.
    ///
    /// The vault salt is created on first use and read on every later call.
    /// On re-open the passphrase is checked against the verification token;
    /// a wrong passphrase fails here instead of producing undecryptable reads.
    pub fn initialize(&mut self, passphrase: &str) -> VaultResult<()> {
        if passphrase.is_empty() {
            return Err(VaultError::validation("passphrase must not be empty"));
        }
        persist::ensure_dir(&self.documents_dir)?;

        let salt = match persist::read_bytes(&self.salt_path)? {
            Some(salt) if salt.len() == SALT_LEN => salt,
            Some(_) => {
                return Err(VaultError::Validation("vault salt has the wrong length".into()));
            }
            None => {
                let salt = crypto::random_bytes(SALT_LEN)?;
                persist::write_bytes_atomic(&self.salt_path, &salt)?;
                info!(path = %self.salt_path.display(), "created vault salt");
                salt
            }
        };

        let record = persist::read_json::<VerificationRecord>(&self.verify_path)?;
        let iterations = record
            .as_ref()
            .map_or(self.kdf_iterations, |r| r.kdf_iterations);
        if iterations == 0 {
            return Err(VaultError::validation("KDF iteration count must be non-zero"));
        }

        debug!(iterations, "deriving master key");
        let master = MasterKey::derive_from_passphrase(passphrase, &salt, iterations)?;
        let verify_key = keys::derive_key(&master, &[], "vault:verify")?;

        match record {
            Some(record) => {
                let opened = record.token.open(verify_key.as_bytes(), &[]);
                if !opened.is_ok_and(|plaintext| plaintext == VERIFICATION_PLAINTEXT) {
                    warn!("vault passphrase rejected");
                    return Err(VaultError::AuthFailure("invalid passphrase".into()));
                }
            }
            None => {
                let record = VerificationRecord {
                    kdf_iterations: iterations,
                    token: SealedBlob::seal(verify_key.as_bytes(), VERIFICATION_PLAINTEXT, &[])?,
                };
                persist::write_json_atomic(&self.verify_path, &record)?;
            }
        }

        self.master = Some(master);
        info!("document store initialized");
        Ok(())
    }

    /// Drop the master key. Stored documents stay on disk.
    pub fn lock(&mut self) {
        self.master = None;
    }

    fn master(&self) -> VaultResult<&MasterKey> {
        self.master.as_ref().ok_or(VaultError::NotInitialized)
    }

    /// Derive a vault-internal key for `purpose` from the master key.
    pub(crate) fn derive_purpose_key(&self, purpose: &str) -> VaultResult<DerivedKey> {
        keys::derive_key(self.master()?, &[], &format!("vault:{purpose}"))
    }

    fn category_dir(&self, category: &str) -> VaultResult<PathBuf> {
        validate_component("category", category)?;
        Ok(self.documents_dir.join(category))
    }

    /// Path of the record for `(category, id)`.
    pub fn document_path(&self, category: &str, id: &str) -> VaultResult<PathBuf> {
        validate_component("document id", id)?;
        Ok(self.category_dir(category)?.join(format!("{id}.json")))
    }

    fn load_record(&self, path: &Path) -> VaultResult<Option<EncryptedDocument>> {
        persist::read_json(path)
    }

    /// The stored record for `(category, id)`, without decrypting it.
    pub fn record(&self, category: &str, id: &str) -> VaultResult<EncryptedDocument> {
        let path = self.document_path(category, id)?;
        self.load_record(&path)?
            .ok_or_else(|| VaultError::not_found("document", format!("{category}/{id}")))
    }

    pub fn document_exists(&self, category: &str, id: &str) -> VaultResult<bool> {
        Ok(self.document_path(category, id)?.is_file())
    }

    /// Encrypt and persist `plaintext` under `(category, id)`.
    ///
    /// Every call uses a fresh IV and a fresh salt. Overwriting an existing
    /// document keeps its `created` time and bumps `version`.
    pub fn store_document(
        &self,
        category: &str,
        id: &str,
        plaintext: &[u8],
    ) -> VaultResult<DocumentMetadata> {
        let master = self.master()?;
        let path = self.document_path(category, id)?;

        let previous = match self.load_record(&path) {
            Ok(previous) => previous,
            Err(VaultError::CorruptState { .. }) => None,
            Err(e) => return Err(e),
        };

        let salt = crypto::random_bytes(SALT_LEN)?;
        let key = keys::derive_document_key(master, &salt, category, id)?;
        let sealed = crypto::encrypt(key.as_bytes(), plaintext, &[])?;

        let now = crate::now_millis();
        let metadata = DocumentMetadata {
            created: previous.as_ref().map_or(now, |p| p.metadata.created),
            modified: now,
            size: plaintext.len(),
            version: previous.as_ref().map_or(1, |p| p.metadata.version + 1),
        };

        let record = EncryptedDocument {
            id: id.to_string(),
            category: category.to_string(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
            salt,
            metadata: metadata.clone(),
        };
        persist::write_json_atomic(&path, &record)?;

        debug!(category, id, version = metadata.version, "document stored");
        Ok(metadata)
    }

    /// Decrypt the document at `(category, id)`.
    ///
    /// Fails with `NotFound` if absent and `IntegrityFailure` if any bit of
    /// the ciphertext, IV, tag or salt has changed. Never returns altered
    /// plaintext.
    pub fn retrieve_document(&self, category: &str, id: &str) -> VaultResult<Vec<u8>> {
        let master = self.master()?;
        let record = match self.record(category, id) {
            Ok(record) => record,
            Err(VaultError::CorruptState { .. }) => return Err(VaultError::IntegrityFailure),
            Err(e) => return Err(e),
        };

        if record.id != id || record.category != category {
            return Err(VaultError::IntegrityFailure);
        }

        let key = keys::derive_document_key(master, &record.salt, category, id)?;
        crypto::decrypt(
            key.as_bytes(),
            &record.ciphertext,
            &record.iv,
            &record.auth_tag,
            &[],
        )
        .map_err(|e| {
            warn!(category, id, "document failed integrity check");
            e
        })
    }

    /// Metadata for every readable record in `category`. Unparseable
    /// entries are skipped, not fatal. Does not require initialization.
    pub fn list_documents(&self, category: &str) -> VaultResult<Vec<DocumentSummary>> {
        let dir = self.category_dir(category)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.load_record(&path) {
                Ok(Some(record)) => summaries.push(DocumentSummary {
                    id: record.id,
                    category: record.category,
                    metadata: record.metadata,
                }),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Category directories that currently exist.
    pub fn list_categories(&self) -> VaultResult<Vec<String>> {
        if !self.documents_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut categories = Vec::new();
        for entry in fs::read_dir(&self.documents_dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    categories.push(name.to_string());
                }
            }
        }
        categories.sort();
        Ok(categories)
    }

    /// Overwrite the record with random bytes of equal length, then remove it.
    pub fn delete_document(&self, category: &str, id: &str) -> VaultResult<()> {
        let path = self.document_path(category, id)?;
        if !path.is_file() {
            return Err(VaultError::not_found("document", format!("{category}/{id}")));
        }
        persist::shred_file(&path)?;
        info!(category, id, "document deleted");
        Ok(())
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("documents_dir", &self.documents_dir)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> DocumentStore {
        let mut store = DocumentStore::new(&VaultConfig::for_testing(dir));
        store.initialize("owner passphrase").unwrap();
        store
    }

    #[test]
    fn uninitialized_store_refuses_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(&VaultConfig::for_testing(dir.path()));
        assert!(matches!(
            store.store_document("medical", "a", b"x"),
            Err(VaultError::NotInitialized)
        ));
        assert!(matches!(
            store.retrieve_document("medical", "a"),
            Err(VaultError::NotInitialized)
        ));
    }

    #[test]
    fn overwrite_bumps_version_and_keeps_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let first = store.store_document("identity", "passport", b"v1").unwrap();
        let second = store.store_document("identity", "passport", b"v2 longer").unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.created, first.created);
        assert_eq!(second.size, 9);
        assert_eq!(store.retrieve_document("identity", "passport").unwrap(), b"v2 longer");
    }

    #[test]
    fn reopen_with_wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        open_store(dir.path())
            .store_document("financial", "tax", b"2025")
            .unwrap();

        let mut store = DocumentStore::new(&VaultConfig::for_testing(dir.path()));
        let err = store.initialize("not the passphrase").unwrap_err();
        assert!(matches!(err, VaultError::AuthFailure(_)));
        assert!(!store.is_initialized());

        store.initialize("owner passphrase").unwrap();
        assert_eq!(store.retrieve_document("financial", "tax").unwrap(), b"2025");
    }

    #[test]
    fn reopen_uses_recorded_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VaultConfig::for_testing(dir.path());
        config.master_kdf_iterations = 1_000;
        let mut store = DocumentStore::new(&config);
        store.initialize("owner passphrase").unwrap();
        store.store_document("medical", "blood", b"O+").unwrap();

        config.master_kdf_iterations = 2_000;
        let mut store = DocumentStore::new(&config);
        store.initialize("owner passphrase").unwrap();
        assert_eq!(store.retrieve_document("medical", "blood").unwrap(), b"O+");
    }

    #[test]
    fn path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.store_document("../etc", "passwd", b"x"),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            store.store_document("medical", "a/b", b"x"),
            Err(VaultError::Validation(_))
        ));
    }

    #[test]
    fn record_moved_to_other_slot_does_not_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.store_document("medical", "a", b"secret").unwrap();

        let mut record = store.record("medical", "a").unwrap();
        record.id = "b".into();
        persist::write_json_atomic(&store.document_path("medical", "b").unwrap(), &record)
            .unwrap();

        assert!(matches!(
            store.retrieve_document("medical", "b"),
            Err(VaultError::IntegrityFailure)
        ));
    }

    #[test]
    fn lock_drops_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.store_document("medical", "a", b"x").unwrap();
        store.lock();
        assert!(matches!(
            store.retrieve_document("medical", "a"),
            Err(VaultError::NotInitialized)
        ));
        // Listing reads metadata only.
        assert_eq!(store.list_documents("medical").unwrap().len(), 1);
    }

    #[test]
    fn list_categories_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.store_document("medical", "a", b"x").unwrap();
        store.store_document("employment", "b", b"y").unwrap();
        assert_eq!(store.list_categories().unwrap(), vec!["employment", "medical"]);
    }
}
