//! Password-based AES-256-GCM encryption for snapshots.

use crate::error::{BackupError, BackupResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce (IV) in bytes.
pub const IV_SIZE: usize = 12;
/// Size of the PBKDF2 salt in bytes.
pub const SALT_SIZE: usize = 16;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Name recorded in the envelope for the key derivation function.
pub const KDF_NAME: &str = "PBKDF2-SHA256";
/// Upper bound on accepted iteration counts when reading a backup.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

/// Key derived from a backup password.
///
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupKey {
    bytes: [u8; KEY_SIZE],
}

impl BackupKey {
    /// Derives a key from a password using PBKDF2-HMAC-SHA256.
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut bytes);
        Self { bytes }
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Returns a fresh random salt.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Returns a fresh random IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// AES-256-GCM cipher bound to one key.
pub struct SnapshotCipher {
    cipher: Aes256Gcm,
}

impl SnapshotCipher {
    /// Creates a cipher for the given key.
    pub fn new(key: &BackupKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    ///
    /// The output is `ciphertext || tag`; the IV is kept by the caller.
    pub fn encrypt(&self, iv: &[u8; IV_SIZE], plaintext: &[u8], aad: &[u8]) -> BackupResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
            .map_err(|_| BackupError::validation("encryption failed"))
    }

    /// Decrypts data produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// A wrong key, tampered or truncated ciphertext, or tampered `aad`
    /// yield [`BackupError::Decryption`]. An IV of the wrong length is a
    /// [`BackupError::Validation`] error.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> BackupResult<Vec<u8>> {
        if iv.len() != IV_SIZE {
            return Err(BackupError::validation(format!(
                "IV must be {IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(BackupError::decryption("ciphertext truncated"));
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
            .map_err(|_| BackupError::decryption("wrong password or corrupted backup"))
    }
}
