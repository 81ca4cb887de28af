//! Biometric artifacts are sealed with AES-256-GCM before they touch
//! disk. Blob layout: 12-byte random nonce followed by the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("sealing key must be {KEY_LEN} bytes ({} hex characters)", KEY_LEN * 2)]
    BadKey,
    #[error("sealing operation failed")]
    Crypto,
}

pub struct Seal {
    cipher: Aes256Gcm,
}

impl Seal {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(hex: &str) -> Result<Self, SealError> {
        let hex = hex.trim();
        if hex.len() != KEY_LEN * 2 {
            return Err(SealError::BadKey);
        }
        let mut key = [0u8; KEY_LEN];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| SealError::BadKey)?;
        }
        Ok(Self::from_key(&key))
    }

    /// Derive a key from a passphrase via SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self::from_key(&key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Crypto)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        if blob.len() <= NONCE_LEN {
            return Err(SealError::Crypto);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Crypto)
    }
}
