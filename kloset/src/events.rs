//! The engine's event stream.
//!
//! Long operations publish coarse progress events that front-ends may
//! subscribe to. The channel is bounded and lossy for progress events:
//! when nobody drains it, the engine drops events rather than blocking or
//! accumulating. Anything that matters for correctness (per-path errors,
//! summaries) is also persisted in the snapshot itself.

use kloset_core::mac::Mac;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Queue depth before progress events start being dropped.
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Clone, Debug)]
pub enum Event {
    /// An importer started producing scan records.
    ScanStarted { root: String },
    /// A pathname was processed.
    Path { pathname: String },
    /// A pathname failed without aborting the operation.
    PathError { pathname: String, message: String },
    /// A snapshot was committed.
    SnapshotDone { identifier: Mac, files: u64, bytes: u64 },
    /// A restore finished.
    RestoreDone { entries: u64, bytes: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        EventBus { tx, rx }
    }

    /// Publishes an event; drops it when the queue is full.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// A receiving handle; multiple subscribers share (steal from) the same
    /// queue.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.rx.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
