//! The data model of a snapshot's filesystem view.
//!
//! Everything here is persisted through `rmp-serde` and addressed by MAC:
//! entries under `VfsEntry`, objects under `Object`, extended attribute
//! records under `XattrEntry`. Chunks are referenced, never embedded.

use super::VfsError;

use kloset_core::mac::{Mac, MAC_SIZE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stat-like metadata captured for every entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub username: String,
    pub groupname: String,
}

impl FileInfo {
    /// Minimal metadata for sources that cannot stat, like stdin streams.
    pub fn synthetic(size: u64, mode: u32) -> FileInfo {
        FileInfo {
            size,
            mode,
            mtime: Utc::now(),
            uid: 0,
            gid: 0,
            nlink: 1,
            username: String::new(),
            groupname: String::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
}

/// One pathname in a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub pathname: String,
    pub kind: EntryKind,
    pub info: FileInfo,
    pub symlink_target: Option<String>,
    pub xattr_names: Vec<String>,
    /// MAC of the [`Object`] holding the file body. Present exactly for
    /// regular entries.
    pub object: Option<Mac>,
}

impl Entry {
    pub fn directory(pathname: String, info: FileInfo) -> Entry {
        Entry {
            pathname,
            kind: EntryKind::Directory,
            info,
            symlink_target: None,
            xattr_names: Vec::new(),
            object: None,
        }
    }

    pub fn regular(pathname: String, info: FileInfo, object: Mac) -> Entry {
        Entry {
            pathname,
            kind: EntryKind::Regular,
            info,
            symlink_target: None,
            xattr_names: Vec::new(),
            object: Some(object),
        }
    }

    pub fn symlink(pathname: String, info: FileInfo, target: String) -> Entry {
        Entry {
            pathname,
            kind: EntryKind::Symlink,
            info,
            symlink_target: Some(target),
            xattr_names: Vec::new(),
            object: None,
        }
    }

    /// Checks the shape invariants on an entry decoded from a repository.
    ///
    /// A violation here describes the decoded record, not a bug in this
    /// process, so it is reported as a `Malformed` diagnostic in every
    /// build profile; `check` keeps walking snapshots that contain such
    /// records.
    pub fn validate(&self) -> Result<(), VfsError> {
        match self.kind {
            EntryKind::Regular if self.object.is_none() => Err(VfsError::Malformed(format!(
                "regular entry {} has no object",
                self.pathname
            ))),
            EntryKind::Directory if self.object.is_some() => Err(VfsError::Malformed(format!(
                "directory entry {} carries an object",
                self.pathname
            ))),
            EntryKind::Symlink if self.symlink_target.is_none() => {
                Err(VfsError::Malformed(format!(
                    "symlink entry {} has no target",
                    self.pathname
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VfsError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Entry, VfsError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A chunk reference: the identity of the plaintext and its length.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRef {
    pub mac: Mac,
    pub length: u32,
}

/// An ordered list of chunks making up a file body or an extended
/// attribute value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Object {
    pub chunks: Vec<ChunkRef>,
    /// MAC over the concatenated chunk MACs; lets a checker validate the
    /// chunk list without fetching a single chunk.
    pub integrity: Mac,
}

impl Object {
    pub fn new(chunks: Vec<ChunkRef>, integrity: Mac) -> Object {
        Object { chunks, integrity }
    }

    /// The byte string the integrity MAC is computed over.
    pub fn integrity_source(chunks: &[ChunkRef]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunks.len() * MAC_SIZE);
        for chunk in chunks {
            out.extend_from_slice(chunk.mac.as_bytes());
        }
        out
    }

    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.length)).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VfsError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Object, VfsError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// One extended attribute of one pathname.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Xattr {
    pub name: String,
    pub size: u64,
    pub object: Mac,
}

impl Xattr {
    pub fn to_bytes(&self) -> Result<Vec<u8>, VfsError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Xattr, VfsError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
