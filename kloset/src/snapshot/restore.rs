/*!
Restoring a snapshot into an exporter.

The walk follows the path tree's own ordering (depth first, then
lexicographic), so a directory always materializes before anything inside
it. File bodies stream chunk by chunk straight from the blob layer, which
authenticates every chunk against its identifier on the way out.
Directory permissions are applied deepest-first at the end, after all
content is in place.
*/

use crate::events::{Event, EventBus};
use crate::exporter::Exporter;
use crate::repository::Repository;
use crate::snapshot::{self, Result, SnapshotError};
use crate::vfs::{ChunkRef, EntryKind, FileInfo};

use kloset_core::cancel::CancelToken;
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use tracing::{info, instrument};

use std::io::{Cursor, Read};

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Restore only the subtree under this pathname.
    pub prefix: Option<String>,
}

/// Streams an object's chunks out of a repository as one `Read`.
struct ObjectReader<'r> {
    repo: &'r Repository,
    chunks: std::vec::IntoIter<ChunkRef>,
    current: Cursor<Vec<u8>>,
}

impl<'r> ObjectReader<'r> {
    fn new(repo: &'r Repository, chunks: Vec<ChunkRef>) -> ObjectReader<'r> {
        ObjectReader {
            repo,
            chunks: chunks.into_iter(),
            current: Cursor::new(Vec::new()),
        }
    }
}

impl<'r> Read for ObjectReader<'r> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let read = self.current.read(buf)?;
            if read > 0 {
                return Ok(read);
            }
            match self.chunks.next() {
                None => return Ok(0),
                Some(chunk) => {
                    let data = self
                        .repo
                        .get_blob(ResourceKind::Chunk, &chunk.mac)
                        .map_err(|e| {
                            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                        })?;
                    self.current = Cursor::new(data);
                }
            }
        }
    }
}

/// Restores (a subtree of) a snapshot. Returns `(entries, bytes)` written.
#[instrument(skip(repo, exporter, events, cancel))]
pub fn restore(
    repo: &Repository,
    snapshot: &Mac,
    options: &RestoreOptions,
    exporter: &mut dyn Exporter,
    events: &EventBus,
    cancel: &CancelToken,
) -> Result<(u64, u64)> {
    let header = snapshot::get_header(repo, snapshot)?;
    let mut vfs = snapshot::open_vfs(repo, &header)?;
    let pairs = vfs.walk(options.prefix.as_deref())?;

    let mut entries: u64 = 0;
    let mut bytes: u64 = 0;
    let mut directories: Vec<(String, FileInfo)> = Vec::new();

    for (pathname, entry_mac) in pairs {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Canceled);
        }
        let entry = vfs.entry_at(&entry_mac)?;
        match entry.kind {
            EntryKind::Directory => {
                exporter.create_directory(&pathname)?;
                directories.push((pathname.clone(), entry.info.clone()));
            }
            EntryKind::Symlink => {
                let target = entry
                    .symlink_target
                    .as_deref()
                    .expect("validate() guarantees symlinks carry a target");
                exporter.create_symlink(&pathname, target)?;
            }
            EntryKind::Regular => {
                let object = vfs.object(&entry)?;
                let mut reader = ObjectReader::new(repo, object.chunks.clone());
                exporter.store_file(&pathname, &mut reader, &entry.info)?;
                exporter.set_permissions(&pathname, &entry.info)?;
                bytes += entry.info.size;
            }
        }
        entries += 1;
        events.emit(Event::Path { pathname });
    }

    // deepest directories first, so tightening permissions cannot lock out
    // the walk itself
    for (pathname, info) in directories.iter().rev() {
        exporter.set_permissions(pathname, info)?;
    }
    exporter.close()?;

    events.emit(Event::RestoreDone { entries, bytes });
    info!(entries, bytes, "restore finished");
    Ok((entries, bytes))
}
