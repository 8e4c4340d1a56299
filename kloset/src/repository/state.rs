//! The live state index.
//!
//! Maps `(kind, mac)` to the packfile range holding the blob. The index is
//! the merge of every state delta present in the store; it is rebuilt by
//! [`crate::Repository::rebuild_state`] and extended by the packer as
//! packfiles land. Readers observe either the pre- or post-merge index,
//! never a partial one: merges happen under the write half of the lock
//! after the deltas are fully decoded.

use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;
use kloset_core::state::{Location, StateDelta};

use parking_lot::RwLock;

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct StateIndex {
    entries: RwLock<HashMap<(u32, Mac), Location>>,
}

impl StateIndex {
    pub fn new() -> StateIndex {
        StateIndex::default()
    }

    pub fn has(&self, kind: ResourceKind, mac: &Mac) -> bool {
        self.entries.read().contains_key(&(kind.as_u32(), *mac))
    }

    pub fn get(&self, kind: ResourceKind, mac: &Mac) -> Option<Location> {
        self.entries.read().get(&(kind.as_u32(), *mac)).copied()
    }

    /// Records a location. The first writer wins; a MAC is never remapped.
    pub fn insert(&self, kind: ResourceKind, mac: Mac, location: Location) {
        self.entries
            .write()
            .entry((kind.as_u32(), mac))
            .or_insert(location);
    }

    /// Folds one decoded delta in.
    pub fn merge(&self, delta: &StateDelta) {
        let mut entries = self.entries.write();
        for (kind, mac, location) in delta.iter() {
            entries.entry((kind.as_u32(), *mac)).or_insert(*location);
        }
    }

    /// Replaces the whole index with the merge of `deltas`, atomically from
    /// the point of view of concurrent readers.
    pub fn rebuild(&self, deltas: &[StateDelta]) {
        let mut fresh = HashMap::new();
        for delta in deltas {
            for (kind, mac, location) in delta.iter() {
                fresh.entry((kind.as_u32(), *mac)).or_insert(*location);
            }
        }
        *self.entries.write() = fresh;
    }

    /// Every MAC known under `kind`, unordered.
    pub fn list(&self, kind: ResourceKind) -> Vec<Mac> {
        let wanted = kind.as_u32();
        self.entries
            .read()
            .keys()
            .filter(|(k, _)| *k == wanted)
            .map(|(_, mac)| *mac)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
