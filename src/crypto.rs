use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroize;

use crate::errors::{BackupError, BackupResult, DecryptCause};

// Changing any of these breaks every existing `.besideyou` file.
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// PBKDF2-HMAC-SHA256. Backups always use [`PBKDF2_ROUNDS`].
fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, &mut key);
    key
}

/// Encrypts under a fresh random nonce. The 16-byte tag is appended to the
/// returned ciphertext.
pub fn encrypt_with_key(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> BackupResult<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| BackupError::ExportFailed(format!("encryption failed: {e}")))?;
    Ok((nonce_bytes, ciphertext))
}

pub fn decrypt_with_key(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
) -> BackupResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
        return Err(BackupError::DecryptionFailed {
            cause: DecryptCause::Truncated,
        });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| BackupError::DecryptionFailed {
            cause: DecryptCause::Authentication,
        })
}

/// Produces `salt || nonce || ciphertext` with a key derived from `passphrase`.
pub fn encrypt_with_passphrase(passphrase: &str, plaintext: &[u8]) -> BackupResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let mut key = derive_key(passphrase, &salt, PBKDF2_ROUNDS);
    let sealed = encrypt_with_key(&key, plaintext);
    key.zeroize();
    let (nonce, ciphertext) = sealed?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Splits a blob at the fixed offsets and authenticates it. Every failure
/// surfaces as the same `DecryptionFailed`.
pub fn decrypt_with_passphrase(passphrase: &str, blob: &[u8]) -> BackupResult<Vec<u8>> {
    if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        debug!(len = blob.len(), "encrypted backup shorter than header and tag");
        return Err(BackupError::DecryptionFailed {
            cause: DecryptCause::Truncated,
        });
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let mut key = derive_key(passphrase, salt, PBKDF2_ROUNDS);
    let opened = decrypt_with_key(&key, nonce, ciphertext);
    key.zeroize();
    if let Err(BackupError::DecryptionFailed { cause }) = &opened {
        debug!(?cause, "encrypted backup failed to open");
    }
    opened
}
