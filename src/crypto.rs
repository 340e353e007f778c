//! Low-level cryptographic operations.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). All other modules perform encryption,
//! decryption, hashing and signature checks exclusively through the
//! functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption), tag kept detached
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **Digest**: SHA-256
//! - **Signatures**: Ed25519 verification over raw 32-byte public keys

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{UnparsedPublicKey, ED25519};

use crate::error::{VaultError, VaultResult};

/// The AEAD algorithm used throughout datavault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce ("iv") in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a master, derived or package key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the per-vault and per-document salts.
pub const SALT_LEN: usize = 32;

/// Output of one AEAD encryption. The three parts are stored separately.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Fill a fixed-size buffer from the system CSPRNG.
pub fn random_array<const N: usize>() -> VaultResult<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::RandomnessFailure)?;
    Ok(buf)
}

/// Produce `len` random bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> VaultResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::RandomnessFailure)?;
    Ok(buf)
}

fn bind_key(key_bytes: &[u8; KEY_LEN]) -> VaultResult<LessSafeKey> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| VaultError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a plaintext with AES-256-GCM under a fresh random nonce.
///
/// `aad` is authenticated but not encrypted; the same bytes must be
/// presented to [`decrypt`].
pub fn encrypt(key_bytes: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> VaultResult<Sealed> {
    let key = bind_key(key_bytes)?;
    let iv: [u8; NONCE_LEN] = random_array()?;

    let mut ciphertext = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(aad),
            &mut ciphertext,
        )
        .map_err(|_| VaultError::EncryptionFailure)?;

    let tag: [u8; TAG_LEN] = tag
        .as_ref()
        .try_into()
        .map_err(|_| VaultError::EncryptionFailure)?;

    Ok(Sealed {
        ciphertext,
        iv,
        tag,
    })
}

/// Decrypt an AES-256-GCM ciphertext with a detached nonce and tag.
///
/// A wrong key, a flipped bit anywhere in `ciphertext`, `iv` or `tag`, a
/// malformed length or mismatched `aad` all fail with
/// [`VaultError::IntegrityFailure`]. The caller receives no partial
/// plaintext.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    ciphertext: &[u8],
    iv: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    let iv: [u8; NONCE_LEN] = iv.try_into().map_err(|_| VaultError::IntegrityFailure)?;
    if tag.len() != TAG_LEN {
        return Err(VaultError::IntegrityFailure);
    }

    let key = bind_key(key_bytes).map_err(|_| VaultError::IntegrityFailure)?;

    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(iv), Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::IntegrityFailure)?;

    Ok(plaintext.to_vec())
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Verify an Ed25519 signature. Never errors: malformed keys or
/// signatures simply do not verify.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .is_ok()
}
