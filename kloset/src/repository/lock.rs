//! Advisory repository locks.
//!
//! A lock is a short-lived blob under a random MAC in the store's lock
//! class. Locks only coordinate cooperating maintenance operations; data
//! integrity never depends on them. A lock older than its TTL is stale and
//! gets swept by the next contender.

use kloset_core::config::Config;
use kloset_core::key::Key;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock record is malformed")]
    Malformed,
    #[error("lock encode error")]
    Encode(#[from] rmp_serde::encode::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: Uuid,
    pub created: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockInfo {
    pub fn new(owner: Uuid, ttl_secs: u64) -> LockInfo {
        LockInfo {
            owner,
            created: Utc::now(),
            ttl_secs,
        }
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() > self.created + Duration::seconds(self.ttl_secs as i64)
    }

    /// Serializes and seals the lock with the repository's record pipeline.
    ///
    /// Locks are addressed by a random MAC rather than a content MAC, so
    /// unsealing verifies only the AEAD tag.
    pub fn seal(&self, config: &Config, key: &Key) -> Result<Vec<u8>, LockError> {
        let plaintext = rmp_serde::to_vec(self)?;
        let compressed = config
            .compression
            .compress(&plaintext)
            .map_err(|_| LockError::Malformed)?;
        config
            .encryption
            .encrypt(&compressed, key)
            .map_err(|_| LockError::Malformed)
    }

    pub fn unseal(record: &[u8], config: &Config, key: &Key) -> Result<LockInfo, LockError> {
        let compressed = config
            .encryption
            .decrypt(record, key)
            .map_err(|_| LockError::Malformed)?;
        let plaintext = config
            .compression
            .decompress(&compressed)
            .map_err(|_| LockError::Malformed)?;
        rmp_serde::from_slice(&plaintext).map_err(|_| LockError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kloset_core::compression::Compression;
    use kloset_core::config::KeySlot;
    use kloset_core::encryption::Encryption;
    use kloset_core::mac::MacAlgorithm;

    fn test_config(key: Key) -> Config {
        Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::Aes256GcmSiv,
            Compression::Lz4 { level: 1 },
            KeySlot::Plain(key),
        )
    }

    #[test]
    fn seal_unseal() {
        let key = Key::random();
        let config = test_config(key.clone());
        let info = LockInfo::new(Uuid::new_v4(), 900);
        let record = info.seal(&config, &key).unwrap();
        assert_eq!(LockInfo::unseal(&record, &config, &key).unwrap(), info);
    }

    #[test]
    fn staleness() {
        let mut info = LockInfo::new(Uuid::new_v4(), 900);
        assert!(!info.is_stale());
        info.created = Utc::now() - Duration::seconds(1000);
        assert!(info.is_stale());
    }
}
