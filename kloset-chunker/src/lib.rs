//! Content-defined chunking for byte streams.
//!
//! A chunker turns a reader into a sequence of owned byte slices whose
//! boundaries depend on the content itself, not on absolute offsets. The
//! engine's deduplication hangs off that property: editing the middle of a
//! file moves only the boundaries near the edit, so untouched regions keep
//! producing the same slices (and therefore the same identifiers) backup
//! after backup.
//!
//! Contract for implementations: concatenating the emitted slices in order
//! must reproduce the input byte for byte, no slice may exceed the
//! configured maximum size, and the same input under the same parameters
//! must split identically on every run. An empty input emits nothing.

pub mod fastcdc;
pub use self::fastcdc::*;

use kloset_core::cancel::CancelToken;

use thiserror::Error;

use std::io::{Cursor, Read};

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("source I/O error")]
    Io(#[from] std::io::Error),
    #[error("chunking was cancelled")]
    Canceled,
}

/// Something that can slice a reader in a defined, repeatable manner.
///
/// The input arrives as `Box<dyn Read + Send>` so one chunker type serves
/// files, network bodies, and in-memory buffers alike; implementations
/// should keep only parameters in `self` and stay cheap to clone.
pub trait Chunker: Clone {
    type Chunks: Iterator<Item = Result<Vec<u8>, ChunkerError>>;

    /// Starts slicing a boxed reader.
    fn chunk_boxed(&self, read: Box<dyn Read + Send + 'static>) -> Self::Chunks;

    /// Boxes a bare reader and slices it.
    fn chunk<R: Read + Send + 'static>(&self, read: R) -> Self::Chunks {
        let boxed: Box<dyn Read + Send + 'static> = Box::new(read);
        self.chunk_boxed(boxed)
    }

    /// Slices an in-memory buffer.
    fn chunk_slice<B: AsRef<[u8]> + Send + 'static>(&self, slice: B) -> Self::Chunks {
        let cursor = Cursor::new(slice);
        let boxed: Box<dyn Read + Send + 'static> = Box::new(cursor);
        self.chunk_boxed(boxed)
    }

    /// Attaches a cancellation token, polled once per emitted slice.
    fn with_cancel(self, token: CancelToken) -> Self;
}
