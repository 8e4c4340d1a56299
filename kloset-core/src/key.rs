/*!
This module contains types for describing and interacting with the
cryptographic key material of a repository.

A repository key is a bundle of independent 32-byte subkeys, one per concern
(encryption, MAC, nonce derivation), plus a random chunker nonce. The bundle
never touches the disk in the clear: it is wrapped with AES-KW (RFC 3394)
under a master key derived from the user passphrase with Argon2id, and the
wrapped form is stored in the repository configuration next to the KDF
parameters and an AEAD-sealed canary used to validate a derived key without
revealing anything about it.
*/

use crate::encryption::{Encryption, EncryptionError};

use aes::cipher::generic_array::GenericArray;
use aes::Aes256;
use aes_kw::Kek;
use argon2::{self, Config, ThreadMode, Variant, Version};
use chrono::{DateTime, Utc};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Error describing things that can go wrong with key handling
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("passphrase does not match this repository")]
    BadPassphrase,
    #[error("something went wrong with argon2")]
    Argon2(#[from] argon2::Error),
    #[error("canary encryption/decryption failed")]
    Encryption(#[from] EncryptionError),
    #[error("canary decode failed")]
    Decode(#[from] serde_cbor::error::Error),
    #[error("wrapped key material is malformed")]
    Malformed,
}

type Result<T> = std::result::Result<T, KeyError>;

/// Serialized length of the raw subkey bundle: three 32-byte subkeys plus
/// the chunker nonce. A multiple of 8, as AES-KW requires.
const KEY_BUNDLE_SIZE: usize = 32 * 3 + 8;

const CANARY_MAGIC: [u8; 16] = *b"KLOSET_CANARY_01";

/// The key material used by a repository.
///
/// Contains four independent pieces:
///
/// - `encryption`: the AEAD key for everything written at rest
/// - `mac`: the key for content-addressed identifiers
/// - `nonce`: the key for deterministic nonce derivation
/// - `chunker_nonce`: a random `u64` for chunker boundary randomization
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    encryption: [u8; 32],
    mac: [u8; 32],
    nonce: [u8; 32],
    chunker_nonce: u64,
}

impl Key {
    /// Securely generates a random bundle of key material.
    pub fn random() -> Key {
        let mut encryption = [0_u8; 32];
        thread_rng().fill_bytes(&mut encryption);
        let mut mac = [0_u8; 32];
        thread_rng().fill_bytes(&mut mac);
        let mut nonce = [0_u8; 32];
        thread_rng().fill_bytes(&mut nonce);
        trace!("generated a random key");
        Key {
            encryption,
            mac,
            nonce,
            chunker_nonce: thread_rng().next_u64(),
        }
    }

    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption
    }

    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac
    }

    pub fn nonce_key(&self) -> &[u8; 32] {
        &self.nonce
    }

    pub fn chunker_nonce(&self) -> u64 {
        self.chunker_nonce
    }

    fn to_bundle(&self) -> [u8; KEY_BUNDLE_SIZE] {
        let mut out = [0_u8; KEY_BUNDLE_SIZE];
        out[..32].copy_from_slice(&self.encryption);
        out[32..64].copy_from_slice(&self.mac);
        out[64..96].copy_from_slice(&self.nonce);
        out[96..].copy_from_slice(&self.chunker_nonce.to_le_bytes());
        out
    }

    fn from_bundle(bundle: &[u8]) -> Result<Key> {
        if bundle.len() != KEY_BUNDLE_SIZE {
            return Err(KeyError::Malformed);
        }
        let mut encryption = [0_u8; 32];
        encryption.copy_from_slice(&bundle[..32]);
        let mut mac = [0_u8; 32];
        mac.copy_from_slice(&bundle[32..64]);
        let mut nonce = [0_u8; 32];
        nonce.copy_from_slice(&bundle[64..96]);
        let mut nonce_bytes = [0_u8; 8];
        nonce_bytes.copy_from_slice(&bundle[96..]);
        Ok(Key {
            encryption,
            mac,
            nonce,
            chunker_nonce: u64::from_le_bytes(nonce_bytes),
        })
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs
        f.debug_struct("Key").finish()
    }
}

/// Parameters for the Argon2id passphrase KDF, stored in the clear next to
/// the wrapped key so the master key can be re-derived on open.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub time_cost: u32,
    pub mem_cost: u32,
    pub parallelism: u32,
    pub salt: [u8; 32],
}

impl KdfParams {
    /// Cost parameters the author considers reasonable at time of writing.
    /// Review them and apply your own judgement before trusting them with
    /// anything you would mind losing.
    pub fn defaults() -> KdfParams {
        let mut salt = [0_u8; 32];
        thread_rng().fill_bytes(&mut salt);
        KdfParams {
            time_cost: 4,
            mem_cost: 65536,
            parallelism: 1,
            salt,
        }
    }

    /// Cheap parameters for tests. Do not use for real repositories.
    pub fn insecure_for_tests() -> KdfParams {
        let mut salt = [0_u8; 32];
        thread_rng().fill_bytes(&mut salt);
        KdfParams {
            time_cost: 1,
            mem_cost: 1024,
            parallelism: 1,
            salt,
        }
    }
}

/// Derives the 32-byte master key from a user passphrase.
pub fn derive_master(passphrase: &[u8], params: &KdfParams) -> Result<[u8; 32]> {
    let config = Config {
        variant: Variant::Argon2id,
        version: Version::Version13,
        mem_cost: params.mem_cost,
        time_cost: params.time_cost,
        thread_mode: if params.parallelism > 1 {
            ThreadMode::Parallel
        } else {
            ThreadMode::Sequential
        },
        lanes: params.parallelism.max(1),
        secret: &[],
        ad: &[],
        hash_length: 32,
    };
    let raw = argon2::hash_raw(passphrase, &params.salt, &config)?;
    let mut master = [0_u8; 32];
    master.copy_from_slice(&raw);
    Ok(master)
}

/// The marker sealed under the repository key at creation time.
///
/// Decrypting it and checking the magic proves a candidate key is the
/// repository key without exposing any key material.
#[derive(Serialize, Deserialize)]
struct Canary {
    magic: [u8; 16],
    created: DateTime<Utc>,
}

/// Stores the repository key, wrapped under a passphrase-derived master key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    kdf: KdfParams,
    wrapped: Vec<u8>,
    canary: Vec<u8>,
}

impl WrappedKey {
    /// Wraps `key` under a master key derived from `passphrase`.
    pub fn wrap(key: &Key, passphrase: &[u8], kdf: KdfParams) -> Result<WrappedKey> {
        let master = derive_master(passphrase, &kdf)?;
        let kek = Kek::<Aes256>::new(GenericArray::from_slice(&master));
        let bundle = key.to_bundle();
        let mut wrapped = vec![0_u8; KEY_BUNDLE_SIZE + 8];
        kek.wrap(&bundle, &mut wrapped)
            .map_err(|_| KeyError::Malformed)?;
        let canary = seal_canary(key)?;
        trace!("wrapped repository key");
        Ok(WrappedKey {
            kdf,
            wrapped,
            canary,
        })
    }

    /// Attempts to unwrap the key material using the supplied passphrase.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::BadPassphrase` if either the AES-KW integrity
    /// check or the canary verification fails.
    pub fn unwrap(&self, passphrase: &[u8]) -> Result<Key> {
        let master = derive_master(passphrase, &self.kdf)?;
        let kek = Kek::<Aes256>::new(GenericArray::from_slice(&master));
        if self.wrapped.len() != KEY_BUNDLE_SIZE + 8 {
            return Err(KeyError::Malformed);
        }
        let mut bundle = vec![0_u8; KEY_BUNDLE_SIZE];
        kek.unwrap(&self.wrapped, &mut bundle)
            .map_err(|_| KeyError::BadPassphrase)?;
        let key = Key::from_bundle(&bundle)?;
        bundle.zeroize();
        verify_canary(&key, &self.canary)?;
        Ok(key)
    }

    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }
}

/// Seals the fixed canary marker under `key`.
pub fn seal_canary(key: &Key) -> Result<Vec<u8>> {
    let canary = Canary {
        magic: CANARY_MAGIC,
        created: Utc::now(),
    };
    let plaintext = serde_cbor::to_vec(&canary)?;
    Ok(Encryption::Aes256GcmSiv.encrypt(&plaintext, key)?)
}

/// Verifies a sealed canary against a candidate key.
pub fn verify_canary(key: &Key, sealed: &[u8]) -> Result<()> {
    let plaintext = Encryption::Aes256GcmSiv
        .decrypt(sealed, key)
        .map_err(|_| KeyError::BadPassphrase)?;
    let canary: Canary =
        serde_cbor::from_slice(&plaintext).map_err(|_| KeyError::BadPassphrase)?;
    if canary.magic != CANARY_MAGIC {
        return Err(KeyError::BadPassphrase);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let key = Key::random();
        let wrapped =
            WrappedKey::wrap(&key, b"a secure passphrase", KdfParams::insecure_for_tests())
                .unwrap();
        let unwrapped = wrapped.unwrap(b"a secure passphrase").unwrap();
        assert_eq!(key, unwrapped);
    }

    #[test]
    fn bad_passphrase() {
        let key = Key::random();
        let wrapped =
            WrappedKey::wrap(&key, b"correct horse", KdfParams::insecure_for_tests()).unwrap();
        match wrapped.unwrap(b"battery staple") {
            Err(KeyError::BadPassphrase) => {}
            other => panic!("expected BadPassphrase, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn canary_rejects_wrong_key() {
        let sealed = seal_canary(&Key::random()).unwrap();
        assert!(verify_canary(&Key::random(), &sealed).is_err());
        let key = Key::random();
        let sealed = seal_canary(&key).unwrap();
        verify_canary(&key, &sealed).unwrap();
    }

    #[test]
    fn bundle_round_trip() {
        let key = Key::random();
        let bundle = key.to_bundle();
        let back = Key::from_bundle(&bundle).unwrap();
        assert_eq!(key, back);
    }
}
