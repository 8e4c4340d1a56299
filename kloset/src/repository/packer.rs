/*!
The packer pool.

A fixed set of worker threads receives `(kind, mac, plaintext)` messages
over bounded channels, each worker feeding its own in-progress
[`PackfileWriter`]. A writer flushes when it grows past the configured
packfile size, and every writer flushes on commit. Flushing serializes the
packfile, uploads it under its own MAC, and folds the index entries into
both the live state index and the pending state delta the next commit
will persist.

Dispatch is round-robin, so a given blob is packed by exactly one worker;
the caller deduplicates against the state index and the pending set before
dispatching, which keeps the MAC-to-location mapping write-once.
*/

use crate::repository::state::StateIndex;
use crate::store::Store;

use kloset_core::config::Config;
use kloset_core::key::Key;
use kloset_core::mac::Mac;
use kloset_core::packfile::PackfileWriter;
use kloset_core::resource::ResourceKind;
use kloset_core::state::{Location, StateDelta};

use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashSet;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Queue depth per worker; dispatch blocks when a worker falls behind.
const WORKER_QUEUE_DEPTH: usize = 64;

pub(crate) enum PackerMessage {
    Blob {
        kind: ResourceKind,
        mac: Mac,
        data: Vec<u8>,
    },
    Flush {
        ack: Sender<Result<(), String>>,
    },
}

/// State shared between the workers and the repository.
pub(crate) struct PackerShared {
    pub store: Arc<dyn Store>,
    pub key: Key,
    pub config: Config,
    pub state: Arc<StateIndex>,
    /// MACs dispatched but not yet flushed into a packfile.
    pub pending: DashSet<(u32, Mac)>,
    /// Index entries accumulated since the last commit.
    pub delta: Mutex<StateDelta>,
}

pub(crate) struct PackerPool {
    shared: Arc<PackerShared>,
    senders: Vec<Sender<PackerMessage>>,
    handles: Vec<thread::JoinHandle<()>>,
    next: AtomicUsize,
    session: Uuid,
}

impl PackerPool {
    pub fn spawn(
        workers: usize,
        store: Arc<dyn Store>,
        key: Key,
        config: Config,
        state: Arc<StateIndex>,
    ) -> PackerPool {
        let session = Uuid::new_v4();
        let shared = Arc::new(PackerShared {
            store,
            key,
            config,
            state,
            pending: DashSet::new(),
            delta: Mutex::new(StateDelta::new(session)),
        });
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = bounded(WORKER_QUEUE_DEPTH);
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("kloset-packer-{}", index))
                .spawn(move || worker_loop(&rx, &shared))
                .expect("spawning a packer thread cannot fail");
            senders.push(tx);
            handles.push(handle);
        }
        PackerPool {
            shared,
            senders,
            handles,
            next: AtomicUsize::new(0),
            session,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn shared(&self) -> &Arc<PackerShared> {
        &self.shared
    }

    /// Hands a blob to a worker. Blocks when the chosen worker's queue is
    /// full, which is the intended backpressure.
    pub fn dispatch(&self, kind: ResourceKind, mac: Mac, data: Vec<u8>) -> Result<(), String> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(PackerMessage::Blob { kind, mac, data })
            .map_err(|_| "packer worker has shut down".to_string())
    }

    /// Flushes every worker's in-progress packfile and waits for all of
    /// them. The first failure wins.
    pub fn flush_all(&self) -> Result<(), String> {
        let mut acks = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            let (ack_tx, ack_rx) = bounded(1);
            sender
                .send(PackerMessage::Flush { ack: ack_tx })
                .map_err(|_| "packer worker has shut down".to_string())?;
            acks.push(ack_rx);
        }
        let mut first_error: Option<String> = None;
        for ack in acks {
            match ack.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error
                        .get_or_insert_with(|| "packer worker died mid-flush".to_string());
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Swaps the accumulated delta out for a fresh one, stamping it with
    /// the given transaction id.
    pub fn take_delta(&self, transaction: Uuid) -> StateDelta {
        let mut slot = self.shared.delta.lock();
        let mut delta = std::mem::replace(&mut *slot, StateDelta::new(self.session));
        delta.session = transaction;
        delta
    }
}

impl Drop for PackerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("a packer worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(rx: &Receiver<PackerMessage>, shared: &Arc<PackerShared>) {
    let mut writer: Option<PackfileWriter> = None;
    let mut sticky_error: Option<String> = None;
    while let Ok(message) = rx.recv() {
        match message {
            PackerMessage::Blob { kind, mac, data } => {
                if sticky_error.is_some() {
                    // the transaction is already doomed; drain the queue so
                    // the producer does not block forever
                    continue;
                }
                let w = writer.get_or_insert_with(|| {
                    PackfileWriter::new(
                        shared.config.compression,
                        shared.config.encryption,
                        shared.key.clone(),
                    )
                });
                if let Err(e) = w.put(kind, mac, &data) {
                    sticky_error = Some(e.to_string());
                    continue;
                }
                if w.size() >= shared.config.packfile_max_size {
                    if let Err(e) = flush_writer(&mut writer, shared) {
                        sticky_error = Some(e);
                    }
                }
            }
            PackerMessage::Flush { ack } => {
                let result = match sticky_error.take() {
                    Some(e) => {
                        writer = None;
                        Err(e)
                    }
                    None => flush_writer(&mut writer, shared),
                };
                // the committer may have given up; nothing to do then
                let _ = ack.send(result);
            }
        }
    }
}

fn flush_writer(
    writer: &mut Option<PackfileWriter>,
    shared: &Arc<PackerShared>,
) -> Result<(), String> {
    let full = match writer.take() {
        None => return Ok(()),
        Some(w) if w.is_empty() => return Ok(()),
        Some(w) => w,
    };
    let blobs = full.blob_count();
    let (bytes, entries) = full.finish().map_err(|e| e.to_string())?;
    let pack_mac = shared.config.mac.mac(
        ResourceKind::Packfile,
        &bytes,
        shared.key.mac_key(),
    );
    shared
        .store
        .put_packfile(pack_mac, &bytes)
        .map_err(|e| format!("packfile upload failed: {}", e))?;
    debug!(%pack_mac, blobs, size = bytes.len(), "flushed packfile");
    let mut delta = shared.delta.lock();
    for entry in entries {
        let location = Location {
            packfile: pack_mac,
            offset: entry.offset,
            length: entry.length,
        };
        shared.state.insert(entry.kind, entry.mac, location);
        delta.insert(entry.kind, entry.mac, location);
        shared.pending.remove(&(entry.kind.as_u32(), entry.mac));
    }
    Ok(())
}
