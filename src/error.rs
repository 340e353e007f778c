//! Error types for datavault.
//!
//! Every public operation returns [`VaultResult`]. Error messages signal
//! *what* failed without revealing *why* in ways that could leak
//! cryptographic state: a tampered ciphertext, a wrong key and a bad
//! signature all surface as the same [`VaultError::IntegrityFailure`].

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`VaultError`], for callers that need to
/// react differently (retry, prompt for resubmission, escalate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Expired,
    AuthFailure,
    Integrity,
    StateConflict,
    Storage,
    Crypto,
    NotInitialized,
    CorruptState,
}

/// The single error type for all datavault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Missing or malformed input, rejected before any crypto or state mutation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// An unknown user, document, request, approval, package or token.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A time-based denial.
    #[error("{0} has expired")]
    Expired(String),

    /// A factor or passphrase did not validate.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Passphrase alone was offered for a user with MFA enabled.
    #[error("multi-factor authentication required")]
    MfaRequired,

    /// AEAD tag mismatch, signature mismatch, wrong key or malformed
    /// ciphertext. Deliberately carries no detail.
    #[error("integrity check failed")]
    IntegrityFailure,

    /// The target is in a state that does not allow the operation.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The document store has not been initialized with a passphrase.
    #[error("vault not initialized")]
    NotInitialized,

    /// A persisted snapshot could not be parsed.
    #[error("persisted state is corrupt: {}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key had the wrong length or was rejected by the primitive.
    #[error("invalid key")]
    InvalidKey,

    #[error("encryption failed")]
    EncryptionFailure,

    #[error("key derivation failed")]
    KeyDerivationFailure,

    #[error("randomness source failed")]
    RandomnessFailure,

    #[error("signing failed")]
    SigningFailure,
}

impl VaultError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Expired(_) => ErrorKind::Expired,
            Self::AuthFailure(_) | Self::MfaRequired => ErrorKind::AuthFailure,
            Self::IntegrityFailure => ErrorKind::Integrity,
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::CorruptState { .. } => ErrorKind::CorruptState,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
            Self::InvalidKey
            | Self::EncryptionFailure
            | Self::KeyDerivationFailure
            | Self::RandomnessFailure
            | Self::SigningFailure => ErrorKind::Crypto,
        }
    }

    /// True for the "passphrase alone is not enough" outcome.
    pub fn requires_mfa(&self) -> bool {
        matches!(self, Self::MfaRequired)
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
