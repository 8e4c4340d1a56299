/*!
State deltas: the persisted index units of a repository.

Every packer session emits one delta describing the blobs it packed and the
packfile ranges they landed in. A repository's logical state is the merge of
all deltas currently present in the store; nothing ever rewrites an existing
delta.
*/

use crate::mac::Mac;
use crate::resource::ResourceKind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::collections::BTreeMap;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state delta encode error")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("state delta decode error")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("state delta references unknown resource kind {0}")]
    UnknownKind(u32),
}

type Result<T> = std::result::Result<T, StateError>;

/// Where a blob lives: which packfile, and the byte range of its encrypted
/// record within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

/// The index entries contributed by one packer session.
///
/// Entries are kept per kind and sorted by MAC before serialization so the
/// on-disk form is canonical.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateDelta {
    pub session: Uuid,
    pub created: DateTime<Utc>,
    entries: BTreeMap<u32, Vec<(Mac, Location)>>,
}

impl StateDelta {
    pub fn new(session: Uuid) -> StateDelta {
        StateDelta {
            session,
            created: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, kind: ResourceKind, mac: Mac, location: Location) {
        self.entries
            .entry(kind.as_u32())
            .or_insert_with(Vec::new)
            .push((mac, location));
    }

    /// Folds another delta into this one. Later insertions of an already
    /// present MAC are kept too; the reader resolves duplicates first-wins.
    pub fn merge(&mut self, other: StateDelta) {
        for (kind, mut entries) in other.entries {
            self.entries
                .entry(kind)
                .or_insert_with(Vec::new)
                .append(&mut entries);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Iterates every `(kind, mac, location)` triple in the delta.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &Mac, &Location)> {
        self.entries.iter().flat_map(|(kind, entries)| {
            let kind = ResourceKind::from_u32(*kind)
                .expect("state deltas only store known kinds");
            entries.iter().map(move |(mac, loc)| (kind, mac, loc))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut canonical = self.clone();
        for entries in canonical.entries.values_mut() {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(rmp_serde::to_vec(&canonical)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<StateDelta> {
        let delta: StateDelta = rmp_serde::from_slice(bytes)?;
        for kind in delta.entries.keys() {
            if ResourceKind::from_u32(*kind).is_none() {
                return Err(StateError::UnknownKind(*kind));
            }
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(n: u8) -> Location {
        Location {
            packfile: Mac::new(&[n; 32]),
            offset: u64::from(n) * 100,
            length: 42,
        }
    }

    #[test]
    fn serialized_form_is_sorted() {
        let mut delta = StateDelta::new(Uuid::new_v4());
        delta.insert(ResourceKind::Chunk, Mac::new(&[9; 32]), location(1));
        delta.insert(ResourceKind::Chunk, Mac::new(&[1; 32]), location(2));
        let bytes = delta.to_bytes().unwrap();
        let back = StateDelta::from_bytes(&bytes).unwrap();
        let macs: Vec<_> = back.iter().map(|(_, mac, _)| *mac).collect();
        assert_eq!(macs, vec![Mac::new(&[1; 32]), Mac::new(&[9; 32])]);
    }

    #[test]
    fn merge_accumulates() {
        let mut a = StateDelta::new(Uuid::new_v4());
        a.insert(ResourceKind::Chunk, Mac::new(&[1; 32]), location(1));
        let mut b = StateDelta::new(Uuid::new_v4());
        b.insert(ResourceKind::Object, Mac::new(&[2; 32]), location(2));
        a.merge(b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn rejects_unknown_kinds() {
        let mut delta = StateDelta::new(Uuid::new_v4());
        delta.entries.insert(9999, vec![(Mac::default(), location(0))]);
        let bytes = rmp_serde::to_vec(&delta).unwrap();
        assert!(StateDelta::from_bytes(&bytes).is_err());
    }
}
