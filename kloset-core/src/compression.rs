use lz4::{Decoder, EncoderBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::io::{copy, Cursor};

/// Error for things that can go wrong compressing or decompressing a buffer
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("I/O error during (de)compression")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, CompressionError>;

/// Marker for the compression algorithm used by a repository.
///
/// Compression runs on individual records whose size is bounded by the
/// chunker, so the whole operation is buffer-to-buffer. No dictionary is
/// shared across records.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd { level: i32 },
    Lz4 { level: u32 },
}

impl Compression {
    /// Compresses the data with the algorithm indicated by the marker.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { level } => {
                let mut output = Vec::<u8>::with_capacity(data.len());
                zstd::stream::copy_encode(data, &mut output, level)?;
                Ok(output)
            }
            Compression::Lz4 { level } => {
                let cursor = Cursor::new(Vec::<u8>::with_capacity(data.len()));
                let mut encoder = EncoderBuilder::new().level(level).build(cursor)?;
                copy(&mut Cursor::new(data), &mut encoder)?;
                let (cursor, result) = encoder.finish();
                result?;
                Ok(cursor.into_inner())
            }
        }
    }

    /// Decompresses data produced by [`Compression::compress`].
    ///
    /// A decode failure here means the record is corrupted; the caller is
    /// expected to surface it as such.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { .. } => {
                let mut output = Vec::<u8>::new();
                zstd::stream::copy_decode(data, &mut output)?;
                Ok(output)
            }
            Compression::Lz4 { .. } => {
                let mut output = Cursor::new(Vec::<u8>::new());
                let mut decoder = Decoder::new(Cursor::new(data))?;
                copy(&mut decoder, &mut output)?;
                let (_input, result) = decoder.finish();
                result?;
                Ok(output.into_inner())
            }
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}
