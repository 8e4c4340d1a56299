/*!
The store provides abstract I/O access to the real location of a
repository's data.

A store knows nothing about encryption, packing, or snapshots: it holds
opaque named blobs in three resource classes (packfiles, states, locks)
plus the one unnamed configuration record, and it promises atomic,
all-or-nothing visibility for every `put`. Everything smarter lives in the
[`crate::repository`] layer above.

Stores are resolved from URIs through a process-wide scheme registry built
at startup; registering the same scheme twice is a configuration error.
*/

use kloset_core::mac::Mac;

use parking_lot::Mutex;
use thiserror::Error;

use std::collections::HashMap;

pub mod filesystem;
pub mod memory;
pub mod ptar;

/// An error for things that can go wrong talking to a store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("resource not found")]
    NotFound,
    #[error("store is not writable: {0}")]
    NotWritable(String),
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("scheme {0} is already registered")]
    DuplicateScheme(String),
    #[error("no store registered for scheme {0}")]
    UnknownScheme(String),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Maps an `io::Error` to `NotFound` where that is what it means.
fn map_not_found(err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::Io(err)
    }
}

/// Access mode a store was opened in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    pub fn can_read(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }
}

/// Backend for opaque named blobs.
///
/// Implementations must make `put_*` atomic: a partially written blob must
/// never become visible under its final name. The filesystem backend gets
/// this from a same-directory tempfile plus rename; single-file formats
/// from append-then-commit framing.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// The URI this store was opened from.
    fn location(&self) -> String;

    fn mode(&self) -> Mode;

    /// Initializes the backing storage and persists the configuration.
    fn create(&self, config: &[u8]) -> Result<()>;

    /// Opens existing storage and returns the configuration bytes.
    fn open(&self) -> Result<Vec<u8>>;

    /// Total size in bytes of everything the store holds.
    fn size(&self) -> Result<u64>;

    fn list_packfiles(&self) -> Result<Vec<Mac>>;
    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64>;
    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>>;
    /// Ranged read within a packfile; backends with server-side ranged
    /// reads are expected to use them rather than fetching the whole blob.
    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>>;
    fn delete_packfile(&self, mac: Mac) -> Result<()>;

    fn list_states(&self) -> Result<Vec<Mac>>;
    fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64>;
    fn get_state(&self, mac: Mac) -> Result<Vec<u8>>;
    fn delete_state(&self, mac: Mac) -> Result<()>;

    fn list_locks(&self) -> Result<Vec<Mac>>;
    fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64>;
    fn get_lock(&self, mac: Mac) -> Result<Vec<u8>>;
    fn delete_lock(&self, mac: Mac) -> Result<()>;

    /// Finalizes the store. Required for formats that commit a directory
    /// structure on close; a no-op elsewhere.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

type StoreFactory = fn(&str) -> Result<Box<dyn Store>>;

/// An explicit, process-wide registry of store backends keyed by URI
/// scheme.
pub struct StoreRegistry {
    factories: Mutex<HashMap<String, StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> StoreRegistry {
        StoreRegistry {
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a backend for `scheme`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateScheme` when the scheme is already taken; two
    /// backends claiming one scheme is a configuration error, not a
    /// last-one-wins situation.
    pub fn register(&self, scheme: &str, factory: StoreFactory) -> Result<()> {
        let mut factories = self.factories.lock();
        if factories.contains_key(scheme) {
            return Err(StoreError::DuplicateScheme(scheme.to_string()));
        }
        factories.insert(scheme.to_string(), factory);
        Ok(())
    }

    /// Resolves a store URI. URIs without a scheme are filesystem paths.
    pub fn resolve(&self, uri: &str) -> Result<Box<dyn Store>> {
        let (scheme, rest) = match uri.find("://") {
            Some(idx) => (&uri[..idx], &uri[idx + 3..]),
            None => ("fs", uri),
        };
        let factory = {
            let factories = self.factories.lock();
            factories
                .get(scheme)
                .copied()
                .ok_or_else(|| StoreError::UnknownScheme(scheme.to_string()))?
        };
        factory(rest)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        StoreRegistry::new()
    }
}

lazy_static::lazy_static! {
    /// The default registry, populated with the built-in backends.
    pub static ref DEFAULT_REGISTRY: StoreRegistry = {
        let registry = StoreRegistry::new();
        registry
            .register("fs", filesystem::factory)
            .expect("fresh registry cannot hold fs yet");
        registry
            .register("mem", memory::factory)
            .expect("fresh registry cannot hold mem yet");
        registry
            .register("ptar", ptar::factory)
            .expect("fresh registry cannot hold ptar yet");
        registry
    };
}

/// Resolves a store URI against the default registry.
pub fn open_store(uri: &str) -> Result<Box<dyn Store>> {
    DEFAULT_REGISTRY.resolve(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_scheme_is_an_error() {
        match open_store("teleport://nowhere") {
            Err(StoreError::UnknownScheme(scheme)) => assert_eq!(scheme, "teleport"),
            other => panic!("expected UnknownScheme, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bare_paths_resolve_to_the_filesystem() {
        let store = open_store("/tmp/some-repo").unwrap();
        assert_eq!(store.location(), "fs:///tmp/some-repo");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = StoreRegistry::new();
        registry.register("fs", filesystem::factory).unwrap();
        match registry.register("fs", filesystem::factory) {
            Err(StoreError::DuplicateScheme(_)) => {}
            other => panic!("expected DuplicateScheme, got {:?}", other),
        }
    }
}
