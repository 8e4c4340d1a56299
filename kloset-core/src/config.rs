/*!
The repository configuration.

The configuration is the only object a store holds that is not addressed by
a MAC: it is the bootstrap record a reader needs before it can derive keys
or resolve anything else. It carries the format version, the algorithm tags,
the chunking and packing parameters, and the (wrapped) key material.
*/

use crate::compression::Compression;
use crate::encryption::Encryption;
use crate::key::{Key, WrappedKey};
use crate::mac::MacAlgorithm;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration encode error")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("configuration decode error")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unsupported repository format version {0}")]
    UnsupportedVersion(u32),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Content-defined chunking parameters, fixed at repository creation so the
/// same data always splits the same way.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ChunkingParams {
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        ChunkingParams {
            min_size: 32_768,
            avg_size: 65_536,
            max_size: 131_072,
        }
    }
}

/// How the repository key reaches the reader.
///
/// `Wrapped` is the normal, passphrase-protected arrangement. `Plain` exists
/// for repositories created with `Encryption::None`, where the key still
/// drives MACs and chunker randomization but secrecy is not a goal.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum KeySlot {
    Plain(Key),
    Wrapped(WrappedKey),
}

/// The persisted repository configuration.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    pub repository_id: Uuid,
    pub mac: MacAlgorithm,
    pub encryption: Encryption,
    pub compression: Compression,
    pub chunking: ChunkingParams,
    /// A packer flushes its in-progress packfile once it grows past this.
    pub packfile_max_size: u64,
    /// Seconds after which an advisory lock is considered stale.
    pub lock_ttl_secs: u64,
    pub key_slot: KeySlot,
}

impl Config {
    pub const DEFAULT_PACKFILE_MAX_SIZE: u64 = 20 * 1024 * 1024;
    pub const DEFAULT_LOCK_TTL_SECS: u64 = 900;

    pub fn new(
        mac: MacAlgorithm,
        encryption: Encryption,
        compression: Compression,
        key_slot: KeySlot,
    ) -> Config {
        Config {
            version: crate::FORMAT_VERSION,
            repository_id: Uuid::new_v4(),
            mac,
            encryption,
            compression,
            chunking: ChunkingParams::default(),
            packfile_max_size: Config::DEFAULT_PACKFILE_MAX_SIZE,
            lock_ttl_secs: Config::DEFAULT_LOCK_TTL_SECS,
            key_slot,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Config> {
        let config: Config = rmp_serde::from_slice(bytes)?;
        if config.version != crate::FORMAT_VERSION {
            return Err(ConfigError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let config = Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::None,
            Compression::Lz4 { level: 4 },
            KeySlot::Plain(Key::random()),
        );
        let bytes = config.to_bytes().unwrap();
        let back = Config::from_bytes(&bytes).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn rejects_future_versions() {
        let mut config = Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::None,
            Compression::None,
            KeySlot::Plain(Key::random()),
        );
        config.version = 999;
        let bytes = rmp_serde::to_vec(&config).unwrap();
        assert!(Config::from_bytes(&bytes).is_err());
    }
}
