/*!
Selectable encryption for everything a repository writes at rest.

The engine uses a deterministic AEAD construction: the nonce for a message is
derived from a keyed hash of the plaintext under a dedicated nonce subkey, so
the same plaintext always produces the same ciphertext. Two blobs therefore
stay deduplicatable after encryption, and the nonce never repeats across
distinct plaintexts.
*/

use crate::key::Key;

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of the nonce prepended to every ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Error describing things that can go wrong with encryption/decryption
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("ciphertext failed authentication")]
    Tampered,
    #[error("ciphertext too short to carry a nonce")]
    Truncated,
    #[error("invalid key material")]
    InvalidKey,
}

type Result<T> = std::result::Result<T, EncryptionError>;

/// Tag for the encryption algorithm used by a repository.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Encryption {
    None,
    Aes256GcmSiv,
}

impl Encryption {
    /// Encrypts `data` with the repository key.
    ///
    /// The output is `nonce ‖ ciphertext` for the AEAD variant, and the
    /// plaintext itself for `Encryption::None`.
    pub fn encrypt(self, data: &[u8], key: &Key) -> Result<Vec<u8>> {
        match self {
            Encryption::None => Ok(data.to_vec()),
            Encryption::Aes256GcmSiv => {
                let cipher = Aes256GcmSiv::new_from_slice(key.encryption_key())
                    .map_err(|_| EncryptionError::InvalidKey)?;
                let nonce_bytes = derive_nonce(data, key.nonce_key());
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(nonce, data)
                    .map_err(|_| EncryptionError::InvalidKey)?;
                let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    /// Decrypts a buffer produced by [`Encryption::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `Tampered` when the AEAD authentication fails, which means
    /// the ciphertext was modified or the key is wrong.
    pub fn decrypt(self, data: &[u8], key: &Key) -> Result<Vec<u8>> {
        match self {
            Encryption::None => Ok(data.to_vec()),
            Encryption::Aes256GcmSiv => {
                if data.len() < NONCE_SIZE {
                    return Err(EncryptionError::Truncated);
                }
                let cipher = Aes256GcmSiv::new_from_slice(key.encryption_key())
                    .map_err(|_| EncryptionError::InvalidKey)?;
                let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
                let nonce = Nonce::from_slice(nonce_bytes);
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| EncryptionError::Tampered)
            }
        }
    }

    /// Returns the fixed per-message overhead in bytes.
    pub fn overhead(self) -> usize {
        match self {
            Encryption::None => 0,
            // 12 byte nonce plus the 16 byte GCM-SIV tag
            Encryption::Aes256GcmSiv => NONCE_SIZE + 16,
        }
    }
}

impl Default for Encryption {
    fn default() -> Self {
        Encryption::Aes256GcmSiv
    }
}

/// Derives the message nonce from the plaintext under the nonce subkey.
fn derive_nonce(data: &[u8], nonce_key: &[u8; 32]) -> [u8; NONCE_SIZE] {
    let digest = blake3::keyed_hash(nonce_key, data);
    let mut nonce = [0_u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = Key::random();
        let data = b"I am but a humble test string".to_vec();
        for algo in [Encryption::None, Encryption::Aes256GcmSiv].iter() {
            let ciphertext = algo.encrypt(&data, &key).unwrap();
            let plaintext = algo.decrypt(&ciphertext, &key).unwrap();
            assert_eq!(plaintext, data);
        }
    }

    #[test]
    fn deterministic_ciphertext() {
        let key = Key::random();
        let data = b"same plaintext, same ciphertext".to_vec();
        let a = Encryption::Aes256GcmSiv.encrypt(&data, &key).unwrap();
        let b = Encryption::Aes256GcmSiv.encrypt(&data, &key).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn detect_tampering() {
        let key = Key::random();
        let data = b"flip a byte, fail the tag".to_vec();
        let mut ciphertext = Encryption::Aes256GcmSiv.encrypt(&data, &key).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        match Encryption::Aes256GcmSiv.decrypt(&ciphertext, &key) {
            Err(EncryptionError::Tampered) => {}
            other => panic!("expected Tampered, got {:?}", other),
        }
    }

    #[test]
    fn wrong_key_fails() {
        let data = b"two keys".to_vec();
        let ciphertext = Encryption::Aes256GcmSiv
            .encrypt(&data, &Key::random())
            .unwrap();
        assert!(Encryption::Aes256GcmSiv
            .decrypt(&ciphertext, &Key::random())
            .is_err());
    }
}
