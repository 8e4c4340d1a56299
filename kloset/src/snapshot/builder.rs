/*!
The snapshot builder: turns one importer's scan into a committed snapshot.

A pool of worker threads drains the importer's bounded record channel.
Regular files are opened through their lazy reader factory (so at most one
reader is open per worker), streamed through the content-defined chunker,
and written chunk by chunk through the repository's deduplicating blob
layer; the chunk list becomes an object, the object an entry, and the
entry lands in the in-memory path tree. Directories, symlinks, and
extended attributes follow the same shape without the chunk pipeline.

Per-path failures (unreadable file, vanished directory) are recorded in
the errors tree and the event stream and do not abort the run. Repository
failures do: the transaction is never committed and the store keeps its
pre-backup state.

On commit the three live trees are persisted post-order into the
repository, their descriptors and the header are written, and one
`commit_transaction` makes the whole snapshot durable at once.
*/

use crate::events::{Event, EventBus};
use crate::importer::{Importer, RecordKind, ScanRecord, ScanResult};
use crate::repository::Repository;
use crate::snapshot::{Result, SnapshotError, SnapshotHeader, Summary};
use crate::vfs::{
    normalize_path, xattr_key, ChunkRef, Entry, Object, PathOrdering, RepositoryNodeStore,
    Xattr,
};

use kloset_btree::mem::MemoryNodeStore;
use kloset_btree::{BTree, Descriptor, Error as TreeError, KeyOrdering, NaturalOrdering, NODE_VERSION};
use kloset_chunker::{Chunker, ChunkerError, FastCdc};
use kloset_core::cancel::CancelToken;
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

/// Order of the in-memory index trees a backup builds.
const LIVE_TREE_ORDER: usize = 50;

type LivePathTree = BTree<String, Mac, MemoryNodeStore<String, Mac>, PathOrdering>;
type LiveXattrTree = BTree<String, Mac, MemoryNodeStore<String, Mac>>;
type LiveErrorTree = BTree<String, String, MemoryNodeStore<String, String>>;

#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// Worker threads draining the scan; also bounds the number of open
    /// readers. Zero means one per CPU.
    pub max_concurrency: usize,
    pub tags: Vec<String>,
    pub job: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            max_concurrency: 0,
            tags: Vec::new(),
            job: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    files: AtomicU64,
    directories: AtomicU64,
    symlinks: AtomicU64,
    xattrs: AtomicU64,
    errors: AtomicU64,
    chunks: AtomicU64,
    total_size: AtomicU64,
}

impl Counters {
    fn summary(&self) -> Summary {
        Summary {
            files: self.files.load(Ordering::Relaxed),
            directories: self.directories.load(Ordering::Relaxed),
            symlinks: self.symlinks.load(Ordering::Relaxed),
            xattrs: self.xattrs.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
        }
    }
}

struct BuildContext<'a> {
    repo: &'a Repository,
    chunker: FastCdc,
    path_tree: &'a Mutex<LivePathTree>,
    xattr_tree: &'a Mutex<LiveXattrTree>,
    error_tree: &'a Mutex<LiveErrorTree>,
    counters: &'a Counters,
    events: &'a EventBus,
    cancel: &'a CancelToken,
    fatal: &'a Mutex<Option<SnapshotError>>,
}

impl<'a> BuildContext<'a> {
    fn abort(&self, error: SnapshotError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            warn!("aborting backup: {}", error);
            *slot = Some(error);
        }
    }

    fn aborted(&self) -> bool {
        self.fatal.lock().is_some()
    }

    // Records a failure that affects one path only.
    fn path_error(&self, pathname: &str, message: String) {
        debug!(pathname, %message, "recording path error");
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.events.emit(Event::PathError {
            pathname: pathname.to_string(),
            message: message.clone(),
        });
        let mut tree = self.error_tree.lock();
        match tree.insert(pathname.to_string(), message) {
            Ok(()) | Err(TreeError::Exists) => {}
            Err(e) => self.abort(e.into()),
        }
    }

    // Writes an entry blob and indexes it. Failures here are repository
    // failures and abort the snapshot.
    fn store_entry(&self, pathname: String, entry: &Entry) -> Result<()> {
        let mac = self
            .repo
            .put_blob(ResourceKind::VfsEntry, entry.to_bytes().map_err(SnapshotError::Vfs)?)?;
        let mut tree = self.path_tree.lock();
        match tree.insert(pathname, mac) {
            // an importer may legitimately emit a pathname twice; the
            // first record wins
            Ok(()) | Err(TreeError::Exists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // Streams one content source into chunk blobs plus an object blob.
    fn store_object(
        &self,
        record_reader: crate::importer::ReaderFactory,
        pathname: &str,
    ) -> Result<Option<(Mac, u64)>> {
        let reader = match record_reader() {
            Ok(reader) => reader,
            Err(e) => {
                self.path_error(pathname, e.to_string());
                return Ok(None);
            }
        };
        let mut chunks: Vec<ChunkRef> = Vec::new();
        let mut size: u64 = 0;
        for piece in self.chunker.chunk_boxed(reader) {
            let data = match piece {
                Ok(data) => data,
                Err(ChunkerError::Canceled) => return Err(SnapshotError::Canceled),
                Err(e) => {
                    self.path_error(pathname, e.to_string());
                    return Ok(None);
                }
            };
            let length = data.len();
            let mac = self.repo.put_blob(ResourceKind::Chunk, data)?;
            chunks.push(ChunkRef {
                mac,
                length: length as u32,
            });
            size += length as u64;
            self.counters.chunks.fetch_add(1, Ordering::Relaxed);
        }
        let integrity = self
            .repo
            .mac_of(ResourceKind::Object, &Object::integrity_source(&chunks));
        let object = Object::new(chunks, integrity);
        let mac = self.repo.put_blob(
            ResourceKind::Object,
            object.to_bytes().map_err(SnapshotError::Vfs)?,
        )?;
        Ok(Some((mac, size)))
    }

    fn process(&self, record: ScanRecord) -> Result<()> {
        let pathname = normalize_path(&record.pathname);
        match record.kind {
            RecordKind::Directory => {
                let entry = Entry::directory(pathname.clone(), record.info);
                self.store_entry(pathname.clone(), &entry)?;
                // the root is the container of the snapshot, not content
                if pathname != "/" {
                    self.counters.directories.fetch_add(1, Ordering::Relaxed);
                }
            }
            RecordKind::Symlink => {
                let target = match record.target {
                    Some(target) => target,
                    None => {
                        self.path_error(&pathname, "symlink record without target".to_string());
                        return Ok(());
                    }
                };
                let entry = Entry::symlink(pathname.clone(), record.info, target);
                self.store_entry(pathname.clone(), &entry)?;
                self.counters.symlinks.fetch_add(1, Ordering::Relaxed);
            }
            RecordKind::Regular => {
                let open = match record.reader {
                    Some(open) => open,
                    None => {
                        self.path_error(&pathname, "file record without content".to_string());
                        return Ok(());
                    }
                };
                let (object_mac, size) = match self.store_object(open, &pathname)? {
                    Some(stored) => stored,
                    None => return Ok(()),
                };
                let mut info = record.info;
                // the streamed size is the truth; the stat may be stale
                info.size = size;
                let mut entry = Entry::regular(pathname.clone(), info, object_mac);
                entry.xattr_names = record.xattr_names;
                self.store_entry(pathname.clone(), &entry)?;
                self.counters.files.fetch_add(1, Ordering::Relaxed);
                self.counters.total_size.fetch_add(size, Ordering::Relaxed);
            }
            RecordKind::Xattr { name } => {
                let open = match record.reader {
                    Some(open) => open,
                    None => {
                        self.path_error(&pathname, "xattr record without content".to_string());
                        return Ok(());
                    }
                };
                let (object_mac, size) = match self.store_object(open, &pathname)? {
                    Some(stored) => stored,
                    None => return Ok(()),
                };
                let xattr = Xattr {
                    name: name.clone(),
                    size,
                    object: object_mac,
                };
                let mac = self.repo.put_blob(
                    ResourceKind::XattrEntry,
                    xattr.to_bytes().map_err(SnapshotError::Vfs)?,
                )?;
                let mut tree = self.xattr_tree.lock();
                match tree.insert(xattr_key(&pathname, &name), mac) {
                    Ok(()) | Err(TreeError::Exists) => {}
                    Err(e) => return Err(e.into()),
                }
                self.counters.xattrs.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.events.emit(Event::Path { pathname });
        Ok(())
    }

    fn worker(&self, rx: &crossbeam_channel::Receiver<ScanResult>) {
        while let Ok(result) = rx.recv() {
            if self.cancel.is_cancelled() {
                self.abort(SnapshotError::Canceled);
                return;
            }
            if self.aborted() {
                return;
            }
            match result {
                ScanResult::Error(error) => {
                    self.path_error(&normalize_path(&error.pathname), error.message);
                }
                ScanResult::Record(record) => {
                    if let Err(e) = self.process(record) {
                        self.abort(e);
                        return;
                    }
                }
            }
        }
    }
}

// Persists one live tree into the repository and writes its descriptor
// blob, returning the descriptor's MAC.
fn persist_tree<V, C>(
    repo: &Repository,
    tree: &mut BTree<String, V, MemoryNodeStore<String, V>, C>,
    node_kind: ResourceKind,
    root_kind: ResourceKind,
) -> Result<Mac>
where
    V: Clone + serde::Serialize + serde::de::DeserializeOwned,
    C: KeyOrdering<String>,
{
    let mut target = RepositoryNodeStore::<V>::new(repo, node_kind);
    let root = tree.persist(&mut target, |_key, value| Ok(value.clone()))?;
    let descriptor = Descriptor {
        version: NODE_VERSION,
        order: tree.order(),
        count: tree.len(),
        root,
    };
    let bytes = rmp_serde::to_vec(&descriptor)?;
    Ok(repo.put_blob(root_kind, bytes)?)
}

/// Runs one backup and commits the resulting snapshot.
///
/// Returns the header blob's MAC together with the header itself.
#[instrument(skip(repo, importer, options, events, cancel))]
pub fn backup(
    repo: &Repository,
    importer: &mut dyn Importer,
    options: &BackupOptions,
    events: &EventBus,
    cancel: &CancelToken,
) -> Result<(Mac, SnapshotHeader)> {
    let started = Instant::now();
    let timestamp = Utc::now();
    let workers = if options.max_concurrency == 0 {
        num_cpus::get()
    } else {
        options.max_concurrency
    };

    let rx = importer.scan()?;
    events.emit(Event::ScanStarted {
        root: importer.root(),
    });
    info!(origin = %importer.origin(), workers, "backup started");

    let path_tree = Mutex::new(BTree::with_ordering(
        MemoryNodeStore::new(),
        LIVE_TREE_ORDER,
        PathOrdering,
    )?);
    let xattr_tree = Mutex::new(BTree::with_ordering(
        MemoryNodeStore::new(),
        LIVE_TREE_ORDER,
        NaturalOrdering,
    )?);
    let error_tree = Mutex::new(BTree::with_ordering(
        MemoryNodeStore::new(),
        LIVE_TREE_ORDER,
        NaturalOrdering,
    )?);
    let counters = Counters::default();
    let fatal = Mutex::new(None);

    let context = BuildContext {
        repo,
        chunker: FastCdc::new(repo.config().chunking).with_cancel(cancel.clone()),
        path_tree: &path_tree,
        xattr_tree: &xattr_tree,
        error_tree: &error_tree,
        counters: &counters,
        events,
        cancel,
        fatal: &fatal,
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let context = &context;
            scope.spawn(move || context.worker(&rx));
        }
    });
    drop(rx);
    importer.close()?;

    if let Some(error) = fatal.into_inner() {
        return Err(error);
    }
    if cancel.is_cancelled() {
        return Err(SnapshotError::Canceled);
    }

    let vfs_root = persist_tree(
        repo,
        &mut path_tree.into_inner(),
        ResourceKind::VfsNode,
        ResourceKind::VfsBtreeRoot,
    )?;
    let xattr_root = persist_tree(
        repo,
        &mut xattr_tree.into_inner(),
        ResourceKind::XattrNode,
        ResourceKind::XattrBtreeRoot,
    )?;
    let errors_root = persist_tree(
        repo,
        &mut error_tree.into_inner(),
        ResourceKind::ErrorNode,
        ResourceKind::ErrorBtreeRoot,
    )?;

    let summary = counters.summary();
    let header = SnapshotHeader {
        identifier: Mac::random(),
        timestamp,
        duration: started.elapsed(),
        sources: vec![importer.root()],
        tags: options.tags.clone(),
        summary,
        job: options.job.clone(),
        importer_type: importer.type_name().to_string(),
        importer_origin: importer.origin(),
        vfs_root,
        xattr_root,
        errors_root,
    };
    let header_mac = repo.put_blob(ResourceKind::Snapshot, header.to_bytes()?)?;
    repo.commit_transaction(Uuid::new_v4())?;

    events.emit(Event::SnapshotDone {
        identifier: header.identifier,
        files: summary.files,
        bytes: summary.total_size,
    });
    info!(
        snapshot = %header_mac,
        files = summary.files,
        directories = summary.directories,
        errors = summary.errors,
        bytes = summary.total_size,
        "backup committed"
    );
    Ok((header_mac, header))
}
