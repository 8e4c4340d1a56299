//! An in-memory store, used for tests and throwaway repositories.
//!
//! Stores resolved from the same `mem://<name>` URI within one process
//! share their contents, which lets tests exercise the full open/reopen
//! cycle without touching a disk.

use super::{Mode, Result, Store, StoreError};

use kloset_core::mac::Mac;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};

use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
    static ref SHARED: Mutex<HashMap<String, MemoryStore>> = Mutex::new(HashMap::new());
}

/// Returns the shared store registered under `name`, creating it on first
/// use.
pub fn factory(location: &str) -> Result<Box<dyn Store>> {
    let mut shared = SHARED.lock();
    let store = shared
        .entry(location.to_string())
        .or_insert_with(|| MemoryStore::new(location))
        .clone();
    Ok(Box::new(store))
}

#[derive(Debug, Default)]
struct Inner {
    config: RwLock<Option<Vec<u8>>>,
    packfiles: RwLock<HashMap<Mac, Vec<u8>>>,
    states: RwLock<HashMap<Mac, Vec<u8>>>,
    locks: RwLock<HashMap<Mac, Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(name: &str) -> MemoryStore {
        MemoryStore {
            name: name.to_string(),
            inner: Arc::new(Inner::default()),
        }
    }
}

fn list(map: &RwLock<HashMap<Mac, Vec<u8>>>) -> Result<Vec<Mac>> {
    Ok(map.read().keys().copied().collect())
}

fn put(map: &RwLock<HashMap<Mac, Vec<u8>>>, mac: Mac, data: &[u8]) -> Result<u64> {
    map.write().insert(mac, data.to_vec());
    Ok(data.len() as u64)
}

fn get(map: &RwLock<HashMap<Mac, Vec<u8>>>, mac: Mac) -> Result<Vec<u8>> {
    map.read().get(&mac).cloned().ok_or(StoreError::NotFound)
}

fn delete(map: &RwLock<HashMap<Mac, Vec<u8>>>, mac: Mac) -> Result<()> {
    map.write().remove(&mac).map(|_| ()).ok_or(StoreError::NotFound)
}

impl Store for MemoryStore {
    fn location(&self) -> String {
        format!("mem://{}", self.name)
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let mut slot = self.inner.config.write();
        if slot.is_some() {
            return Err(StoreError::NotWritable(format!(
                "a repository already exists at mem://{}",
                self.name
            )));
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.inner.config.read().clone().ok_or(StoreError::NotFound)
    }

    fn size(&self) -> Result<u64> {
        let inner = &self.inner;
        let config = inner.config.read().as_ref().map(|c| c.len()).unwrap_or(0);
        let sum = |map: &RwLock<HashMap<Mac, Vec<u8>>>| -> usize {
            map.read().values().map(Vec::len).sum()
        };
        Ok((config + sum(&inner.packfiles) + sum(&inner.states) + sum(&inner.locks)) as u64)
    }

    fn list_packfiles(&self) -> Result<Vec<Mac>> {
        list(&self.inner.packfiles)
    }

    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        put(&self.inner.packfiles, mac, data)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>> {
        get(&self.inner.packfiles, mac)
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let map = self.inner.packfiles.read();
        let pack = map.get(&mac).ok_or(StoreError::NotFound)?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > pack.len() {
            return Err(StoreError::Transport(format!(
                "range {}..{} outside packfile of {} bytes",
                start,
                end,
                pack.len()
            )));
        }
        Ok(pack[start..end].to_vec())
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        delete(&self.inner.packfiles, mac)
    }

    fn list_states(&self) -> Result<Vec<Mac>> {
        list(&self.inner.states)
    }

    fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        put(&self.inner.states, mac, data)
    }

    fn get_state(&self, mac: Mac) -> Result<Vec<u8>> {
        get(&self.inner.states, mac)
    }

    fn delete_state(&self, mac: Mac) -> Result<()> {
        delete(&self.inner.states, mac)
    }

    fn list_locks(&self) -> Result<Vec<Mac>> {
        list(&self.inner.locks)
    }

    fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        put(&self.inner.locks, mac, data)
    }

    fn get_lock(&self, mac: Mac) -> Result<Vec<u8>> {
        get(&self.inner.locks, mac)
    }

    fn delete_lock(&self, mac: Mac) -> Result<()> {
        delete(&self.inner.locks, mac)
    }
}
