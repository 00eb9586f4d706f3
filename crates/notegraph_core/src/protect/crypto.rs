//! Symmetric encryption primitives for protected notes.
//!
//! # Invariants
//! - Every encryption uses a fresh random 96-bit nonce, stored in front of
//!   the ciphertext.
//! - Key material is zeroed when a `DataKey` is dropped and never printed.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use zeroize::{Zeroize, Zeroizing};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
/// Salt length used for passphrase derivation.
pub const SALT_LEN: usize = 16;
// scrypt cost: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    KeyInit,
    /// Passphrase derivation rejected its parameters.
    Derive,
    Encrypt,
    /// Authentication failed: wrong key or tampered ciphertext.
    Decrypt,
    /// Stored value is too short or not valid base64/UTF-8.
    Malformed(String),
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyInit => write!(f, "AES key init failed"),
            Self::Derive => write!(f, "scrypt key derivation failed"),
            Self::Encrypt => write!(f, "AES-GCM encrypt failed"),
            Self::Decrypt => write!(f, "AES-GCM decrypt failed"),
            Self::Malformed(message) => write!(f, "malformed ciphertext: {message}"),
        }
    }
}

impl Error for CryptoError {}

/// 256-bit symmetric key for note encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    /// Fresh random key from the OS generator.
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> CryptoResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::KeyInit)
    }
}

impl Debug for DataKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypts bytes into `nonce || ciphertext`.
pub fn encrypt_bytes(key: &DataKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = key.cipher()?;
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`encrypt_bytes`].
pub fn decrypt_bytes(key: &DataKey, stored: &[u8]) -> CryptoResult<Vec<u8>> {
    if stored.len() < NONCE_LEN {
        return Err(CryptoError::Malformed(format!(
            "expected at least {NONCE_LEN} bytes, got {}",
            stored.len()
        )));
    }
    let (nonce, ciphertext) = stored.split_at(NONCE_LEN);
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Encrypts a title into base64 text so it stays storable as TEXT.
pub fn encrypt_title(key: &DataKey, title: &str) -> CryptoResult<String> {
    Ok(STANDARD.encode(encrypt_bytes(key, title.as_bytes())?))
}

pub fn decrypt_title(key: &DataKey, stored: &str) -> CryptoResult<String> {
    let raw = STANDARD
        .decode(stored.as_bytes())
        .map_err(|err| CryptoError::Malformed(format!("title is not base64: {err}")))?;
    String::from_utf8(decrypt_bytes(key, &raw)?)
        .map_err(|_| CryptoError::Malformed("title is not UTF-8".to_string()))
}

/// Derives a key-encryption key from a passphrase with scrypt.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> CryptoResult<DataKey> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|_| CryptoError::Derive)?;
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, out.as_mut_slice())
        .map_err(|_| CryptoError::Derive)?;
    Ok(DataKey(*out))
}

/// Base64 hash that proves knowledge of `key` without storing it.
pub fn verification_hash(key: &DataKey, salt: &[u8]) -> String {
    let digest = Sha256::new()
        .chain_update(b"notegraph-verify")
        .chain_update(key.as_bytes())
        .chain_update(salt)
        .finalize();
    STANDARD.encode(digest)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
