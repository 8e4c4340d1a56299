/*!
The repository implements the content-addressed key-value store everything
higher level is built on.

A repository pairs a [`Store`] with the derived key material, the parsed
configuration, a live state index, and a pool of packer workers. Writers
call [`Repository::put_blob`], which deduplicates against everything
already known, computes the blob's identity, and hands the plaintext to a
packer; durability arrives with [`Repository::commit_transaction`], which
flushes every in-progress packfile and persists a state delta describing
the transaction. Readers resolve `(kind, mac)` through the state index to
a packfile range, and every byte read is authenticated against the
identifier it was requested under.

# Deduplication

A blob is written at most once per repository: `put_blob` consults the
state index (blobs already durable) and the pending set (blobs queued in
this transaction) before dispatching, and each packer deduplicates within
its own pack as a final guard. Writing the same plaintext twice under the
same kind is a no-op returning the same MAC.
*/

pub mod lock;
pub mod packer;
pub mod state;

use crate::store::{Store, StoreError};

use self::lock::{LockError, LockInfo};
use self::packer::PackerPool;
use self::state::StateIndex;

use kloset_core::compression::CompressionError;
use kloset_core::config::{Config, ConfigError, KeySlot};
use kloset_core::encryption::EncryptionError;
use kloset_core::key::{Key, KeyError};
use kloset_core::mac::Mac;
use kloset_core::packfile::{self, PackfileError};
use kloset_core::resource::ResourceKind;
use kloset_core::state::{StateDelta, StateError};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use std::sync::Arc;

/// An error for all the things that can go wrong with a repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("blob not found in repository")]
    BlobNotFound,
    #[error("store error")]
    Store(#[from] StoreError),
    #[error("packfile error")]
    Packfile(#[from] PackfileError),
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("key error")]
    Key(#[from] KeyError),
    #[error("state error")]
    State(#[from] StateError),
    #[error("encryption error")]
    Encryption(#[from] EncryptionError),
    #[error("compression error")]
    Compression(#[from] CompressionError),
    #[error("lock error")]
    Lock(#[from] LockError),
    #[error("packer error: {0}")]
    Packer(String),
    #[error("repository is locked by another operation")]
    Locked,
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

pub struct Repository {
    store: Arc<dyn Store>,
    config: Config,
    key: Key,
    state: Arc<StateIndex>,
    packer: PackerPool,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("location", &self.store.location())
            .finish()
    }
}

impl Repository {
    /// Initializes new backing storage and opens a repository over it.
    ///
    /// The caller supplies the unwrapped key matching the config's key
    /// slot, having just generated (and possibly wrapped) it.
    #[instrument(skip(store, config, key))]
    pub fn create(store: Box<dyn Store>, config: Config, key: Key) -> Result<Repository> {
        info!(location = %store.location(), "creating repository");
        store.create(&config.to_bytes()?)?;
        Ok(Self::assemble(store.into(), config, key))
    }

    /// Opens an existing repository and rebuilds its state index.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::BadPassphrase` (wrapped) when the repository is
    /// passphrase-protected and the passphrase is absent or wrong.
    #[instrument(skip(store, passphrase))]
    pub fn open(store: Box<dyn Store>, passphrase: Option<&[u8]>) -> Result<Repository> {
        let config_bytes = store.open()?;
        let config = Config::from_bytes(&config_bytes)?;
        let key = match &config.key_slot {
            KeySlot::Plain(key) => key.clone(),
            KeySlot::Wrapped(wrapped) => {
                let passphrase = passphrase.ok_or(KeyError::BadPassphrase)?;
                wrapped.unwrap(passphrase)?
            }
        };
        let repository = Self::assemble(store.into(), config, key);
        repository.rebuild_state()?;
        info!(
            location = %repository.store.location(),
            blobs = repository.state.len(),
            "opened repository"
        );
        Ok(repository)
    }

    fn assemble(store: Arc<dyn Store>, config: Config, key: Key) -> Repository {
        let state = Arc::new(StateIndex::new());
        let packer = PackerPool::spawn(
            num_cpus::get(),
            store.clone(),
            key.clone(),
            config.clone(),
            state.clone(),
        );
        Repository {
            store,
            config,
            key,
            state,
            packer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Computes the identifier `data` would have under `kind` in this
    /// repository.
    pub fn mac_of(&self, kind: ResourceKind, data: &[u8]) -> Mac {
        self.config.mac.mac(kind, data, self.key.mac_key())
    }

    /// Queues a blob for packing and returns its identifier immediately.
    ///
    /// The blob becomes durable (and readable) after the next
    /// [`Repository::commit_transaction`]. Writing a blob that is already
    /// known, durable or pending, is a no-op.
    pub fn put_blob(&self, kind: ResourceKind, data: Vec<u8>) -> Result<Mac> {
        let mac = self.mac_of(kind, &data);
        if self.state.has(kind, &mac) {
            return Ok(mac);
        }
        if !self.packer.shared().pending.insert((kind.as_u32(), mac)) {
            return Ok(mac);
        }
        self.packer
            .dispatch(kind, mac, data)
            .map_err(RepositoryError::Packer)?;
        Ok(mac)
    }

    /// Whether `(kind, mac)` resolves in the committed state.
    pub fn has_blob(&self, kind: ResourceKind, mac: &Mac) -> bool {
        self.state.has(kind, mac)
    }

    /// Fetches, decrypts, and authenticates a committed blob.
    pub fn get_blob(&self, kind: ResourceKind, mac: &Mac) -> Result<Vec<u8>> {
        let location = self
            .state
            .get(kind, mac)
            .ok_or(RepositoryError::BlobNotFound)?;
        let record = self.store.get_packfile_blob(
            location.packfile,
            location.offset,
            location.length,
        )?;
        Ok(packfile::read_record(
            &record,
            kind,
            mac,
            self.config.compression,
            self.config.encryption,
            self.config.mac,
            &self.key,
        )?)
    }

    /// Every committed MAC under `kind`, unordered.
    pub fn list_blobs(&self, kind: ResourceKind) -> Vec<Mac> {
        self.state.list(kind)
    }

    /// Lists committed snapshot header MACs.
    pub fn snapshots(&self) -> Vec<Mac> {
        self.state.list(ResourceKind::Snapshot)
    }

    /// Rebuilds the live index from every state blob in the store.
    #[instrument(skip(self))]
    pub fn rebuild_state(&self) -> Result<()> {
        let macs = self.store.list_states()?;
        let mut deltas = Vec::with_capacity(macs.len());
        for mac in macs {
            let record = self.store.get_state(mac)?;
            let plaintext = packfile::read_record(
                &record,
                ResourceKind::State,
                &mac,
                self.config.compression,
                self.config.encryption,
                self.config.mac,
                &self.key,
            )?;
            deltas.push(StateDelta::from_bytes(&plaintext)?);
        }
        debug!(deltas = deltas.len(), "rebuilt state index");
        self.state.rebuild(&deltas);
        Ok(())
    }

    /// Makes everything queued since the last commit durable.
    ///
    /// Flushes every packer's in-progress packfile, then uploads one state
    /// delta describing the transaction. After this returns, `get_blob` on
    /// a freshly opened repository succeeds for every blob queued before
    /// the call. Returns the state blob's MAC, or `None` when the
    /// transaction added nothing new.
    #[instrument(skip(self))]
    pub fn commit_transaction(&self, transaction: Uuid) -> Result<Option<Mac>> {
        self.packer.flush_all().map_err(RepositoryError::Packer)?;
        let delta = self.packer.take_delta(transaction);
        if delta.is_empty() {
            debug!("transaction added no new blobs, no state written");
            return Ok(None);
        }
        let plaintext = delta.to_bytes()?;
        let compressed = self.config.compression.compress(&plaintext)?;
        let record = self.config.encryption.encrypt(&compressed, &self.key)?;
        let mac = self.mac_of(ResourceKind::State, &plaintext);
        self.store.put_state(mac, &record)?;
        info!(%transaction, blobs = delta.len(), state = %mac, "committed transaction");
        Ok(Some(mac))
    }

    /// Acquires the advisory maintenance lock, sweeping stale locks on the
    /// way.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::Locked` when another live lock exists.
    pub fn acquire_lock(&self) -> Result<Mac> {
        for existing in self.store.list_locks()? {
            let record = match self.store.get_lock(existing) {
                Ok(record) => record,
                Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            match LockInfo::unseal(&record, &self.config, &self.key) {
                Ok(info) if info.is_stale() => {
                    debug!(lock = %existing, "sweeping stale lock");
                    let _ = self.store.delete_lock(existing);
                }
                Ok(_) => return Err(RepositoryError::Locked),
                Err(_) => {
                    // unreadable lock: written by someone with a different
                    // key, or corrupt; treat as held to stay on the safe side
                    warn!(lock = %existing, "found unreadable lock");
                    return Err(RepositoryError::Locked);
                }
            }
        }
        let mac = Mac::random();
        let info = LockInfo::new(self.packer.session(), self.config.lock_ttl_secs);
        let record = info.seal(&self.config, &self.key)?;
        self.store.put_lock(mac, &record)?;
        Ok(mac)
    }

    pub fn release_lock(&self, mac: Mac) -> Result<()> {
        match self.store.delete_lock(mac) {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Shuts the packer pool down and finalizes the store.
    pub fn close(self) -> Result<()> {
        let Repository { store, packer, .. } = self;
        drop(packer);
        store.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    use kloset_core::compression::Compression;
    use kloset_core::encryption::Encryption;
    use kloset_core::mac::MacAlgorithm;

    fn fresh_repo(name: &str) -> Repository {
        let key = Key::random();
        let config = Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::Aes256GcmSiv,
            Compression::Zstd { level: 1 },
            KeySlot::Plain(key.clone()),
        );
        let store = Box::new(MemoryStore::new(name));
        Repository::create(store, config, key).unwrap()
    }

    #[test]
    fn put_commit_get() {
        let repo = fresh_repo("put-commit-get");
        let data = b"some chunk bytes".to_vec();
        let mac = repo.put_blob(ResourceKind::Chunk, data.clone()).unwrap();
        // not durable yet
        assert!(!repo.has_blob(ResourceKind::Chunk, &mac));
        repo.commit_transaction(Uuid::new_v4()).unwrap().unwrap();
        assert!(repo.has_blob(ResourceKind::Chunk, &mac));
        assert_eq!(repo.get_blob(ResourceKind::Chunk, &mac).unwrap(), data);
    }

    #[test]
    fn commit_survives_reopen() {
        let key = Key::random();
        let config = Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::Aes256GcmSiv,
            Compression::Lz4 { level: 1 },
            KeySlot::Plain(key.clone()),
        );
        let store = MemoryStore::new("reopen");
        let repo =
            Repository::create(Box::new(store.clone()), config, key).unwrap();
        let mac = repo
            .put_blob(ResourceKind::Object, b"object body".to_vec())
            .unwrap();
        repo.commit_transaction(Uuid::new_v4()).unwrap();
        repo.close().unwrap();

        let reopened = Repository::open(Box::new(store), None).unwrap();
        assert_eq!(
            reopened.get_blob(ResourceKind::Object, &mac).unwrap(),
            b"object body"
        );
    }

    #[test]
    fn duplicate_put_is_a_noop() {
        let repo = fresh_repo("dedup");
        let data = b"written exactly once".to_vec();
        let first = repo.put_blob(ResourceKind::Chunk, data.clone()).unwrap();
        let second = repo.put_blob(ResourceKind::Chunk, data.clone()).unwrap();
        assert_eq!(first, second);
        repo.commit_transaction(Uuid::new_v4()).unwrap();
        // and again, after it is durable
        let third = repo.put_blob(ResourceKind::Chunk, data).unwrap();
        assert_eq!(first, third);
        assert!(repo.commit_transaction(Uuid::new_v4()).unwrap().is_none());
        assert_eq!(repo.list_blobs(ResourceKind::Chunk).len(), 1);
    }

    #[test]
    fn unknown_blob_is_not_found() {
        let repo = fresh_repo("unknown-blob");
        match repo.get_blob(ResourceKind::Chunk, &Mac::random()) {
            Err(RepositoryError::BlobNotFound) => {}
            other => panic!("expected BlobNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn locks_exclude_each_other() {
        let repo = fresh_repo("locks");
        let lock = repo.acquire_lock().unwrap();
        assert!(matches!(
            repo.acquire_lock(),
            Err(RepositoryError::Locked)
        ));
        repo.release_lock(lock).unwrap();
        let again = repo.acquire_lock().unwrap();
        repo.release_lock(again).unwrap();
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let key = Key::random();
        let wrapped = kloset_core::key::WrappedKey::wrap(
            &key,
            b"sesame",
            kloset_core::key::KdfParams::insecure_for_tests(),
        )
        .unwrap();
        let config = Config::new(
            MacAlgorithm::Blake3Keyed,
            Encryption::Aes256GcmSiv,
            Compression::None,
            KeySlot::Wrapped(wrapped),
        );
        let store = MemoryStore::new("wrong-pass");
        Repository::create(Box::new(store.clone()), config, key)
            .unwrap()
            .close()
            .unwrap();

        assert!(Repository::open(Box::new(store.clone()), Some(b"open says me")).is_err());
        assert!(Repository::open(Box::new(store.clone()), None).is_err());
        Repository::open(Box::new(store), Some(b"sesame")).unwrap();
    }
}
