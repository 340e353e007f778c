//! Key derivation and ownership.
//!
//! This module owns three responsibilities:
//! 1. Deriving the vault master key from the owner passphrase (PBKDF2) and
//!    per-document keys from the master key (HKDF-SHA256).
//! 2. Holding key material in types that are opaque and zeroised on drop.
//! 3. The vault's Ed25519 signing key and passphrase hashing for users.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `crypto`). The derivation logic lives here because it
//! operates on the key material itself, not on ciphertexts.
//!
//! ## Derivation structure
//!
//! ```text
//! master   = PBKDF2-HMAC-SHA256(passphrase, vault_salt, iterations)
//! document = HKDF-SHA256(ikm = master, salt = document_salt,
//!                        info = "document:{category}:{id}")
//! purpose  = HKDF-SHA256(ikm = master, salt = [], info = "vault:{purpose}")
//! ```
//!
//! Each unique salt/info combination produces a statistically independent
//! key. Knowing one derived key reveals nothing about the master key or
//! any other derived key.

use std::fmt;
use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hkdf;
use ring::pbkdf2;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::error::{VaultError, VaultResult};

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Length of a stored passphrase hash.
pub const PASSPHRASE_HASH_LEN: usize = 32;

fn iterations(count: u32) -> VaultResult<NonZeroU32> {
    NonZeroU32::new(count)
        .ok_or_else(|| VaultError::validation("KDF iteration count must be non-zero"))
}

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The vault master key. Every document key is derived from it.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
/// - Never persisted; re-derived from the passphrase on every open.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes. Intended for tests and for
    /// callers that source the key from an external KMS.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Harden a passphrase into a master key with PBKDF2-HMAC-SHA256.
    pub fn derive_from_passphrase(
        passphrase: &str,
        salt: &[u8],
        iteration_count: u32,
    ) -> VaultResult<Self> {
        let mut bytes = [0u8; KEY_LEN];
        pbkdf2::derive(
            PBKDF2_ALG,
            iterations(iteration_count)?,
            salt,
            passphrase.as_bytes(),
            &mut bytes,
        );
        Ok(Self { bytes })
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Derived key
// ---------------------------------------------------------------------------

/// A key derived from the master key for a single document or purpose.
///
/// - Not `Clone`.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// HKDF-SHA256 expansion of the master key under `salt` and `info`.
pub(crate) fn derive_key(master: &MasterKey, salt: &[u8], info: &str) -> VaultResult<DerivedKey> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(master.as_bytes());

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| VaultError::KeyDerivationFailure)?;

    let mut derived = [0u8; KEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| VaultError::KeyDerivationFailure)?;

    Ok(DerivedKey { bytes: derived })
}

/// Derive the key for a document from its own random salt. The category
/// and id are bound into the HKDF info string.
pub(crate) fn derive_document_key(
    master: &MasterKey,
    salt: &[u8],
    category: &str,
    id: &str,
) -> VaultResult<DerivedKey> {
    derive_key(master, salt, &format!("document:{category}:{id}"))
}

// ---------------------------------------------------------------------------
// Symmetric transfer keys
// ---------------------------------------------------------------------------

/// A random 256-bit key handed to a caller out of band: the package
/// encryption key, or the key material minted with an access token.
///
/// Cloneable because the caller must be able to transmit it, but zeroised
/// on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_LEN],
}

/// The key that encrypts a data package.
pub type PackageKey = SymmetricKey;

impl SymmetricKey {
    pub fn generate() -> VaultResult<Self> {
        Ok(Self {
            bytes: crypto::random_array()?,
        })
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Encode for out-of-band transmission.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn from_base64(encoded: &str) -> VaultResult<Self> {
        let decoded = Zeroizing::new(STANDARD.decode(encoded).map_err(|_| VaultError::InvalidKey)?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Compare digests rather than raw bytes so timing does not track the
    /// length of a matching key prefix.
    pub(crate) fn matches(&self, other: &SymmetricKey) -> bool {
        crypto::sha256(&self.bytes) == crypto::sha256(&other.bytes)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Signing key
// ---------------------------------------------------------------------------

/// An Ed25519 key pair.
///
/// Used as the vault's package signing key, and by requesters and devices
/// to produce signatures the vault verifies. The PKCS#8 document is kept
/// (zeroised on drop) so the pair can be sealed and persisted.
pub struct SigningKey {
    pair: Ed25519KeyPair,
    pkcs8: Zeroizing<Vec<u8>>,
}

impl SigningKey {
    pub fn generate() -> VaultResult<Self> {
        let rng = SystemRandom::new();
        let document =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| VaultError::RandomnessFailure)?;
        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> VaultResult<Self> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8).map_err(|_| VaultError::InvalidKey)?;
        Ok(Self {
            pair,
            pkcs8: Zeroizing::new(pkcs8.to_vec()),
        })
    }

    pub(crate) fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.pair.sign(message).as_ref().to_vec()
    }

    /// Raw 32-byte Ed25519 public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.pair.public_key().as_ref().to_vec()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key())
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Passphrase hashing
// ---------------------------------------------------------------------------

/// Salted PBKDF2 hash of a user passphrase, for storage in the auth store.
pub(crate) fn hash_passphrase(
    passphrase: &str,
    salt: &[u8],
    iteration_count: u32,
) -> VaultResult<[u8; PASSPHRASE_HASH_LEN]> {
    let mut out = [0u8; PASSPHRASE_HASH_LEN];
    pbkdf2::derive(
        PBKDF2_ALG,
        iterations(iteration_count)?,
        salt,
        passphrase.as_bytes(),
        &mut out,
    );
    Ok(out)
}

/// Check a passphrase against a stored hash. `pbkdf2::verify` compares in
/// constant time.
pub(crate) fn verify_passphrase(
    passphrase: &str,
    salt: &[u8],
    iteration_count: u32,
    expected: &[u8],
) -> bool {
    let Ok(rounds) = iterations(iteration_count) else {
        return false;
    };
    pbkdf2::verify(PBKDF2_ALG, rounds, salt, passphrase.as_bytes(), expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_keys_differ_per_salt_and_slot() {
        let master = MasterKey::from_bytes([1u8; KEY_LEN]);
        let a = derive_document_key(&master, &[1u8; 32], "medical", "vax-1").unwrap();
        let b = derive_document_key(&master, &[2u8; 32], "medical", "vax-1").unwrap();
        let c = derive_document_key(&master, &[1u8; 32], "identity", "vax-1").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let a = MasterKey::derive_from_passphrase("correct horse", b"salt", 10).unwrap();
        let b = MasterKey::derive_from_passphrase("correct horse", b"salt", 10).unwrap();
        let c = MasterKey::derive_from_passphrase("correct horse", b"pepper", 10).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn zero_iterations_rejected() {
        assert!(MasterKey::derive_from_passphrase("pw", b"salt", 0).is_err());
        assert!(!verify_passphrase("pw", b"salt", 0, &[0u8; 32]));
    }

    #[test]
    fn passphrase_hash_verifies() {
        let hash = hash_passphrase("hunter2", b"user-salt", 10).unwrap();
        assert!(verify_passphrase("hunter2", b"user-salt", 10, &hash));
        assert!(!verify_passphrase("hunter3", b"user-salt", 10, &hash));
    }

    #[test]
    fn signing_key_survives_pkcs8_roundtrip() {
        let key = SigningKey::generate().unwrap();
        let restored = SigningKey::from_pkcs8(key.pkcs8()).unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        let sig = restored.sign(b"payload");
        assert!(crypto::verify_signature(&key.public_key(), b"payload", &sig));
    }

    #[test]
    fn symmetric_key_base64_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let decoded = SymmetricKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);
        assert!(SymmetricKey::from_base64("c2hvcnQ=").is_err());
        assert_eq!(format!("{key:?}"), "SymmetricKey(..)");
    }
}
