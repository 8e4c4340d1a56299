/*!
Repository-to-repository synchronization.

Sync walks the blob graph reachable from selected snapshots (index tree
nodes, entries, objects, chunks, descriptors, and the header itself) and
copies every blob the destination is missing, then commits one
transaction there under the destination's advisory lock. Blobs are
decrypted on read and re-encrypted on write, so the two repositories may
use different encryption keys; what they must share is MAC key material
and algorithm, since blob identities are embedded in every cross
reference.
*/

use crate::repository::Repository;
use crate::snapshot::{self, Result, SnapshotError};
use crate::vfs::{Entry, EntryKind, Object};

use kloset_core::cancel::CancelToken;
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use std::collections::HashSet;

struct Copier<'a> {
    src: &'a Repository,
    dst: &'a Repository,
    cancel: &'a CancelToken,
    seen: HashSet<(u32, Mac)>,
    copied: u64,
}

impl<'a> Copier<'a> {
    fn new(src: &'a Repository, dst: &'a Repository, cancel: &'a CancelToken) -> Copier<'a> {
        Copier {
            src,
            dst,
            cancel,
            seen: HashSet::new(),
            copied: 0,
        }
    }

    // Copies one blob if the destination lacks it. Returns the source
    // bytes when they had to be fetched, letting callers decode them
    // without a second read.
    fn copy(&mut self, kind: ResourceKind, mac: &Mac) -> Result<Option<Vec<u8>>> {
        if self.cancel.is_cancelled() {
            return Err(SnapshotError::Canceled);
        }
        if !self.seen.insert((kind.as_u32(), *mac)) {
            return Ok(None);
        }
        if self.dst.has_blob(kind, mac) {
            return Ok(None);
        }
        let bytes = self.src.get_blob(kind, mac)?;
        let written = self.dst.put_blob(kind, bytes.clone())?;
        if written != *mac {
            // the destination derives different identities; its references
            // would all dangle
            return Err(SnapshotError::KeyMismatch);
        }
        self.copied += 1;
        Ok(Some(bytes))
    }

    fn fetch(&mut self, kind: ResourceKind, mac: &Mac) -> Result<Vec<u8>> {
        match self.copy(kind, mac)? {
            Some(bytes) => Ok(bytes),
            None => Ok(self.src.get_blob(kind, mac)?),
        }
    }

    fn copy_object_graph(&mut self, object_mac: &Mac) -> Result<()> {
        let bytes = self.fetch(ResourceKind::Object, object_mac)?;
        let object = Object::from_bytes(&bytes).map_err(SnapshotError::Vfs)?;
        for chunk in &object.chunks {
            self.copy(ResourceKind::Chunk, &chunk.mac)?;
        }
        Ok(())
    }
}

fn sync_one(copier: &mut Copier<'_>, snapshot: &Mac) -> Result<()> {
    let header = snapshot::get_header(copier.src, snapshot)?;
    let mut vfs = snapshot::open_vfs(copier.src, &header)?;

    // path tree: nodes, entries, objects, chunks
    let mut entry_macs: Vec<Mac> = Vec::new();
    for item in vfs.tree().iter_dfs() {
        let (ptr, node) = item?;
        if node.is_leaf() {
            entry_macs.extend(node.values.iter().copied());
        }
        copier.copy(ResourceKind::VfsNode, &ptr)?;
    }
    for entry_mac in entry_macs {
        let bytes = copier.fetch(ResourceKind::VfsEntry, &entry_mac)?;
        let entry = Entry::from_bytes(&bytes).map_err(SnapshotError::Vfs)?;
        if entry.kind == EntryKind::Regular {
            if let Some(object_mac) = entry.object {
                copier.copy_object_graph(&object_mac)?;
            }
        }
    }

    // xattr tree: nodes, xattr records, their objects and chunks
    let mut xattr_macs: Vec<Mac> = Vec::new();
    for item in vfs.xattr_tree().iter_dfs() {
        let (ptr, node) = item?;
        if node.is_leaf() {
            xattr_macs.extend(node.values.iter().copied());
        }
        copier.copy(ResourceKind::XattrNode, &ptr)?;
    }
    for xattr_mac in xattr_macs {
        let bytes = copier.fetch(ResourceKind::XattrEntry, &xattr_mac)?;
        let xattr = crate::vfs::Xattr::from_bytes(&bytes).map_err(SnapshotError::Vfs)?;
        copier.copy_object_graph(&xattr.object)?;
    }

    // errors tree: nodes only, the messages live in the leaves
    for item in vfs.error_tree().iter_dfs() {
        let (ptr, _node) = item?;
        copier.copy(ResourceKind::ErrorNode, &ptr)?;
    }

    copier.copy(ResourceKind::VfsBtreeRoot, &header.vfs_root)?;
    copier.copy(ResourceKind::XattrBtreeRoot, &header.xattr_root)?;
    copier.copy(ResourceKind::ErrorBtreeRoot, &header.errors_root)?;
    copier.copy(ResourceKind::Snapshot, snapshot)?;
    debug!(snapshot = %snapshot, "snapshot graph copied");
    Ok(())
}

fn commit_under_lock(dst: &Repository) -> Result<()> {
    let lock = dst.acquire_lock()?;
    let result = dst.commit_transaction(Uuid::new_v4());
    let release = dst.release_lock(lock);
    result?;
    release?;
    Ok(())
}

fn key_material_matches(src: &Repository, dst: &Repository) -> bool {
    src.config().mac == dst.config().mac && src.key().mac_key() == dst.key().mac_key()
}

/// Copies one snapshot (and everything it references) into `dst`.
///
/// Returns the number of blobs copied; zero means the destination already
/// had the snapshot.
#[instrument(skip(src, dst, cancel))]
pub fn sync_snapshot(
    src: &Repository,
    dst: &Repository,
    snapshot: &Mac,
    cancel: &CancelToken,
) -> Result<u64> {
    if !key_material_matches(src, dst) {
        return Err(SnapshotError::KeyMismatch);
    }
    if dst.has_blob(ResourceKind::Snapshot, snapshot) {
        return Ok(0);
    }
    let mut copier = Copier::new(src, dst, cancel);
    sync_one(&mut copier, snapshot)?;
    commit_under_lock(dst)?;
    info!(blobs = copier.copied, "synchronized snapshot");
    Ok(copier.copied)
}

/// Copies every snapshot `dst` is missing.
#[instrument(skip(src, dst, cancel))]
pub fn sync_all(src: &Repository, dst: &Repository, cancel: &CancelToken) -> Result<u64> {
    if !key_material_matches(src, dst) {
        return Err(SnapshotError::KeyMismatch);
    }
    let mut copier = Copier::new(src, dst, cancel);
    let mut synchronized = 0;
    for (mac, _header) in snapshot::list_headers(src)? {
        if dst.has_blob(ResourceKind::Snapshot, &mac) {
            continue;
        }
        sync_one(&mut copier, &mac)?;
        synchronized += 1;
    }
    if synchronized > 0 {
        commit_under_lock(dst)?;
    }
    info!(
        snapshots = synchronized,
        blobs = copier.copied,
        "synchronized repositories"
    );
    Ok(copier.copied)
}
