//! Optional AES-GCM payload encryption for cache entries.
//!
//! Keys come from the OS secret store, an external collaborator;
//! this module only knows how to seal/open a payload given a 32-byte key
//! already in hand, and how to zero that key's in-memory copy once it is no
//! longer needed. Mixing encrypted and plaintext entries in one cache root
//! is rejected at open time by the caller (see `cache::file::FileBackend::open`).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CoreError;

const NONCE_LEN: usize = 12;

/// A 32-byte AES-256-GCM key that zeroes itself on drop.
pub struct CacheEncryptionKey(Box<[u8; 32]>);

impl CacheEncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Box::new(bytes))
    }
}

impl Drop for CacheEncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Encrypts `plaintext`, returning `nonce || ciphertext` ready to write to
/// disk or a remote store.
pub fn seal(key: &CacheEncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.0.as_ref()));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| CoreError::Cache {
        message: format!("encryption failed: {e}"),
    })?;
    let mut out = nonce_bytes.to_vec();
    out.append(&mut ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]. The plaintext is returned as a `Vec<u8>` the caller
/// owns and is responsible for zeroing if it stays in memory longer than
/// necessary.
pub fn open(key: &CacheEncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CoreError> {
    if sealed.len() < NONCE_LEN {
        return Err(CoreError::Cache {
            message: "sealed payload shorter than a nonce".to_string(),
        });
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.0.as_ref()));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CoreError::Cache {
            message: format!("decryption failed: {e}"),
        })
}
