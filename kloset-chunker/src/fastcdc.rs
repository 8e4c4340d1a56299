//! FastCDC over a sliding window.
//!
//! The boundary search itself comes from the `fastcdc` crate, which wants
//! a contiguous in-memory slice. To feed it from an arbitrary reader, the
//! iterator keeps one `max_size` window over the stream and tracks a
//! consumption cursor into it: cutting a slice just advances the cursor,
//! and the window is compacted and topped up from the reader before each
//! boundary search. A boundary is only ever computed against a full
//! window (or the final partial one once the reader is dry), so the split
//! positions depend on content and parameters alone.

use super::{Chunker, ChunkerError};

use kloset_core::cancel::CancelToken;
use kloset_core::config::ChunkingParams;

use std::io::Read;

/// A FastCDC [`Chunker`] configured from repository chunking parameters.
#[derive(Clone)]
pub struct FastCdc {
    params: ChunkingParams,
    cancel: Option<CancelToken>,
}

impl FastCdc {
    pub fn new(params: ChunkingParams) -> FastCdc {
        FastCdc {
            params,
            cancel: None,
        }
    }

    pub fn params(&self) -> ChunkingParams {
        self.params
    }
}

impl Default for FastCdc {
    fn default() -> Self {
        FastCdc::new(ChunkingParams::default())
    }
}

impl Chunker for FastCdc {
    type Chunks = FastCdcChunks;

    fn chunk_boxed(&self, read: Box<dyn Read + Send + 'static>) -> Self::Chunks {
        FastCdcChunks {
            params: self.params,
            cancel: self.cancel.clone(),
            source: read,
            window: vec![0_u8; self.params.max_size],
            cursor: 0,
            filled: 0,
            source_dry: false,
        }
    }

    fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Iterator over the slices of one stream.
///
/// Invariant: `cursor <= filled <= window.len()`, and `window[cursor..
/// filled]` is exactly the data read from the source but not yet emitted.
pub struct FastCdcChunks {
    params: ChunkingParams,
    cancel: Option<CancelToken>,
    source: Box<dyn Read + Send + 'static>,
    window: Vec<u8>,
    /// First byte not yet emitted.
    cursor: usize,
    /// One past the last byte read from the source.
    filled: usize,
    source_dry: bool,
}

impl FastCdcChunks {
    // Moves the unconsumed tail to the front of the window and reads until
    // the window is full again or the source runs out.
    fn top_up(&mut self) -> Result<(), ChunkerError> {
        if self.cursor > 0 {
            self.window.copy_within(self.cursor..self.filled, 0);
            self.filled -= self.cursor;
            self.cursor = 0;
        }
        while !self.source_dry && self.filled < self.window.len() {
            let count = self.source.read(&mut self.window[self.filled..])?;
            if count == 0 {
                self.source_dry = true;
            }
            self.filled += count;
        }
        Ok(())
    }

    // Length of the next slice, decided by the FastCDC boundary search
    // over everything currently pending in the window.
    fn next_boundary(&self) -> usize {
        let pending = &self.window[self.cursor..self.filled];
        fastcdc::FastCDC::new(
            pending,
            self.params.min_size,
            self.params.avg_size,
            self.params.max_size,
        )
        .next()
        .map(|found| found.length)
        .unwrap_or_else(|| pending.len())
    }
}

impl Iterator for FastCdcChunks {
    type Item = Result<Vec<u8>, ChunkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Some(Err(ChunkerError::Canceled));
            }
        }
        if let Err(e) = self.top_up() {
            return Some(Err(e));
        }
        if self.cursor == self.filled {
            return None;
        }
        let length = self.next_boundary();
        let piece = self.window[self.cursor..self.cursor + length].to_vec();
        self.cursor += length;
        Some(Ok(piece))
    }
}
