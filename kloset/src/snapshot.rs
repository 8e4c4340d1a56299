/*!
Snapshots: immutable, named views of one backup run.

A snapshot is a header blob tying together the three persisted index trees
of a [`crate::vfs::Vfs`], the identity of the importer that produced it,
and a summary of what was captured. Headers are blobs like everything
else: listing snapshots is a state-index enumeration, and a snapshot
becomes visible exactly when the transaction that wrote it commits.
*/

pub mod builder;
pub mod check;
pub mod restore;
pub mod sync;

use crate::importer::ImporterError;
use crate::repository::{Repository, RepositoryError};
use crate::vfs::{Vfs, VfsError};

use kloset_chunker::ChunkerError;
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

/// An error for everything that can go wrong around snapshots
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot not found")]
    NotFound,
    #[error("repository error")]
    Repository(#[from] RepositoryError),
    #[error("filesystem view error")]
    Vfs(#[from] VfsError),
    #[error("index tree error")]
    Tree(#[from] kloset_btree::Error),
    #[error("chunker error")]
    Chunker(#[from] ChunkerError),
    #[error("importer error")]
    Importer(#[from] ImporterError),
    #[error("record decode error")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("record encode error")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("operation was cancelled")]
    Canceled,
    #[error("synchronization requires both repositories to share MAC key material")]
    KeyMismatch,
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// What one backup run captured.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub xattrs: u64,
    pub errors: u64,
    pub chunks: u64,
    pub total_size: u64,
}

/// The header blob persisted under `ResourceKind::Snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnapshotHeader {
    /// Random 32-byte identity assigned when the backup starts. The header
    /// blob itself is additionally addressed by its content MAC.
    pub identifier: Mac,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub sources: Vec<String>,
    pub tags: Vec<String>,
    pub summary: Summary,
    pub job: Option<String>,
    pub importer_type: String,
    pub importer_origin: String,
    /// Descriptor blob of the path tree.
    pub vfs_root: Mac,
    /// Descriptor blob of the xattr tree.
    pub xattr_root: Mac,
    /// Descriptor blob of the errors tree.
    pub errors_root: Mac,
}

impl SnapshotHeader {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SnapshotHeader> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Fetches and decodes one snapshot header.
pub fn get_header(repo: &Repository, mac: &Mac) -> Result<SnapshotHeader> {
    match repo.get_blob(ResourceKind::Snapshot, mac) {
        Ok(bytes) => SnapshotHeader::from_bytes(&bytes),
        Err(RepositoryError::BlobNotFound) => Err(SnapshotError::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Every snapshot in the repository, oldest first.
pub fn list_headers(repo: &Repository) -> Result<Vec<(Mac, SnapshotHeader)>> {
    let mut out = Vec::new();
    for mac in repo.snapshots() {
        out.push((mac, get_header(repo, &mac)?));
    }
    out.sort_by_key(|(_, header)| header.timestamp);
    Ok(out)
}

/// Resolves a snapshot from a hex prefix of either its header MAC or its
/// identifier.
pub fn resolve(repo: &Repository, prefix: &str) -> Result<Mac> {
    let prefix = prefix.to_ascii_lowercase();
    let mut matches = Vec::new();
    for mac in repo.snapshots() {
        if mac.to_hex().starts_with(&prefix) {
            matches.push(mac);
            continue;
        }
        let header = get_header(repo, &mac)?;
        if header.identifier.to_hex().starts_with(&prefix) {
            matches.push(mac);
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        _ => Err(SnapshotError::NotFound),
    }
}

/// Opens the filesystem view of a snapshot.
pub fn open_vfs<'r>(repo: &'r Repository, header: &SnapshotHeader) -> Result<Vfs<'r>> {
    Ok(Vfs::open(
        repo,
        &header.vfs_root,
        &header.xattr_root,
        &header.errors_root,
    )?)
}
