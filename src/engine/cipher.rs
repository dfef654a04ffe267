//! Optional at-rest encryption for log frames and attachment bodies.
//!
//! Callers see plaintext on both sides; ciphertext exists only on disk.
//! The sealed layout is `scheme byte | nonce | ciphertext` for AES-256-GCM
//! and `scheme byte | plaintext` when encryption is disabled, so a store
//! opened in the wrong mode is detected on the first frame.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

/// Scheme tag for plaintext payloads.
const SCHEME_PLAIN: u8 = 0;

/// Scheme tag for AES-256-GCM payloads.
const SCHEME_AES_GCM: u8 = 1;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Seals and opens byte payloads at rest.
#[derive(Clone)]
pub enum FrameCipher {
    /// No key configured; payloads pass through with a plaintext tag.
    Plain,
    /// AES-256-GCM with a key derived from the configured key string.
    Aes(Box<Aes256Gcm>),
}

impl FrameCipher {
    /// Build a cipher from the configured key string. An empty string
    /// disables encryption.
    pub fn from_key(key: &str) -> Self {
        if key.is_empty() {
            FrameCipher::Plain
        } else {
            let digest = Sha256::digest(key.as_bytes());
            let key = Key::<Aes256Gcm>::from_slice(&digest);
            FrameCipher::Aes(Box::new(Aes256Gcm::new(key)))
        }
    }

    /// Whether payloads are encrypted at rest.
    pub fn is_encrypting(&self) -> bool {
        matches!(self, FrameCipher::Aes(_))
    }

    /// Seal a plaintext payload for writing to disk.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        match self {
            FrameCipher::Plain => {
                let mut out = Vec::with_capacity(1 + plain.len());
                out.push(SCHEME_PLAIN);
                out.extend_from_slice(plain);
                Ok(out)
            }
            FrameCipher::Aes(cipher) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let ciphertext = cipher
                    .encrypt(&nonce, plain)
                    .map_err(|_| StoreError::Encryption("encryption failed".into()))?;

                let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
                out.push(SCHEME_AES_GCM);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Open a sealed payload read from disk.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let (&scheme, rest) = sealed
            .split_first()
            .ok_or_else(|| StoreError::Corruption("empty sealed payload".into()))?;

        match (scheme, self) {
            (SCHEME_PLAIN, FrameCipher::Plain) => Ok(rest.to_vec()),
            (SCHEME_AES_GCM, FrameCipher::Aes(cipher)) => {
                if rest.len() < NONCE_LEN {
                    return Err(StoreError::Corruption("sealed payload too short".into()));
                }
                let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| {
                        StoreError::Encryption("decryption failed (wrong key or corrupt data)".into())
                    })
            }
            (SCHEME_PLAIN, FrameCipher::Aes(_)) => Err(StoreError::Encryption(
                "store was written without encryption but a key is configured".into(),
            )),
            (SCHEME_AES_GCM, FrameCipher::Plain) => Err(StoreError::Encryption(
                "store is encrypted but no key is configured".into(),
            )),
            _ => Err(StoreError::Corruption(format!(
                "unknown seal scheme: {}",
                scheme
            ))),
        }
    }
}
