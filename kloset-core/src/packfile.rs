/*!
The packfile is the only container format a repository ever uploads for bulk
data. It is an append-only sequence of encrypted, compressed records followed
by an encrypted footer that indexes every record, and a trailing `u32`
little-endian footer length:

```text
[record …] [encrypted footer] [footerLen u32 LE]
```

Each record is `encrypt(compress(plaintext))`. The footer plaintext is a
flat array of fixed-width entries, one per record:

```text
kind   u32  LE
mac    [32] bytes
offset u64  LE
length u32  LE
```

The packfile as a whole is addressed by the MAC of its complete byte
sequence under `ResourceKind::Packfile`; readers never need to trust a
packfile's own claims about itself, since every record is verified against
the plaintext MAC it was filed under.
*/

use crate::compression::{Compression, CompressionError};
use crate::encryption::{Encryption, EncryptionError};
use crate::key::Key;
use crate::mac::{Mac, MacAlgorithm, MAC_SIZE};
use crate::resource::ResourceKind;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::trace;

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};

/// Serialized width of one footer entry.
pub const FOOTER_ENTRY_SIZE: usize = 4 + MAC_SIZE + 8 + 4;

/// Error for the various ways a packfile can fail us
#[derive(Error, Debug)]
pub enum PackfileError {
    #[error("record failed verification: {0}")]
    Corruption(String),
    #[error("encryption error")]
    Encryption(#[from] EncryptionError),
    #[error("compression error")]
    Compression(#[from] CompressionError),
    #[error("packfile footer references unknown resource kind {0}")]
    UnknownKind(u32),
    #[error("packfile too short to carry a footer")]
    Truncated,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, PackfileError>;

/// One footer entry: where a blob's encrypted record lives inside the pack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PackfileEntry {
    pub kind: ResourceKind,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
}

impl PackfileEntry {
    fn to_write(&self, mut write: impl Write) -> Result<()> {
        write.write_u32::<LittleEndian>(self.kind.as_u32())?;
        write.write_all(self.mac.as_bytes())?;
        write.write_u64::<LittleEndian>(self.offset)?;
        write.write_u32::<LittleEndian>(self.length)?;
        Ok(())
    }

    fn from_read(mut read: impl Read) -> Result<PackfileEntry> {
        let raw_kind = read.read_u32::<LittleEndian>()?;
        let kind =
            ResourceKind::from_u32(raw_kind).ok_or(PackfileError::UnknownKind(raw_kind))?;
        let mut mac = [0_u8; MAC_SIZE];
        read.read_exact(&mut mac)?;
        let offset = read.read_u64::<LittleEndian>()?;
        let length = read.read_u32::<LittleEndian>()?;
        Ok(PackfileEntry {
            kind,
            mac: Mac::from_bytes(mac),
            offset,
            length,
        })
    }
}

/// Accumulates records in memory until the caller decides to flush.
///
/// The writer deduplicates within itself: a `(kind, mac)` pair already
/// present in the pack is dropped on a second `put`. Cross-pack
/// deduplication is the repository's job, it consults the state index
/// before dispatching anything here.
pub struct PackfileWriter {
    compression: Compression,
    encryption: Encryption,
    key: Key,
    buffer: Vec<u8>,
    index: Vec<PackfileEntry>,
    seen: HashSet<(u32, Mac)>,
}

impl PackfileWriter {
    pub fn new(compression: Compression, encryption: Encryption, key: Key) -> PackfileWriter {
        PackfileWriter {
            compression,
            encryption,
            key,
            buffer: Vec::new(),
            index: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Appends a record for `plaintext`, filed under `(kind, mac)`.
    ///
    /// Returns `false` (and writes nothing) when the pair is already in this
    /// pack.
    pub fn put(&mut self, kind: ResourceKind, mac: Mac, plaintext: &[u8]) -> Result<bool> {
        if !self.seen.insert((kind.as_u32(), mac)) {
            trace!(kind = kind.name(), %mac, "dropping duplicate record");
            return Ok(false);
        }
        let compressed = self.compression.compress(plaintext)?;
        let record = self.encryption.encrypt(&compressed, &self.key)?;
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(&record);
        self.index.push(PackfileEntry {
            kind,
            mac,
            offset,
            length: record.len() as u32,
        });
        Ok(true)
    }

    /// Current serialized size of the record area.
    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn blob_count(&self) -> usize {
        self.index.len()
    }

    /// Serializes the footer and returns the finished packfile bytes along
    /// with the index entries to be folded into a state delta.
    pub fn finish(mut self) -> Result<(Vec<u8>, Vec<PackfileEntry>)> {
        let mut footer = Vec::with_capacity(self.index.len() * FOOTER_ENTRY_SIZE);
        for entry in &self.index {
            entry.to_write(&mut footer)?;
        }
        let sealed = self.encryption.encrypt(&footer, &self.key)?;
        self.buffer.extend_from_slice(&sealed);
        self.buffer.write_u32::<LittleEndian>(sealed.len() as u32)?;
        Ok((self.buffer, self.index))
    }
}

/// Decrypts, decompresses, and verifies one record fetched from a packfile.
///
/// `record` must be exactly the byte range the state index recorded for the
/// blob. On MAC mismatch the record is corrupted (or the range was wrong)
/// and `PackfileError::Corruption` is returned.
pub fn read_record(
    record: &[u8],
    kind: ResourceKind,
    expected: &Mac,
    compression: Compression,
    encryption: Encryption,
    mac_algorithm: MacAlgorithm,
    key: &Key,
) -> Result<Vec<u8>> {
    let compressed = encryption.decrypt(record, key)?;
    let plaintext = compression.decompress(&compressed)?;
    if !mac_algorithm.verify(kind, &plaintext, key.mac_key(), expected) {
        return Err(PackfileError::Corruption(format!(
            "{} blob {} does not match its identifier",
            kind, expected
        )));
    }
    Ok(plaintext)
}

/// Parses the footer of a complete packfile.
///
/// Used by maintenance operations that rebuild state from raw packfiles; the
/// normal read path goes through the state index and never touches footers.
pub fn read_footer(
    pack: &[u8],
    encryption: Encryption,
    key: &Key,
) -> Result<Vec<PackfileEntry>> {
    if pack.len() < 4 {
        return Err(PackfileError::Truncated);
    }
    let mut tail = Cursor::new(&pack[pack.len() - 4..]);
    let footer_len = tail.read_u32::<LittleEndian>()? as usize;
    if pack.len() < 4 + footer_len {
        return Err(PackfileError::Truncated);
    }
    let sealed = &pack[pack.len() - 4 - footer_len..pack.len() - 4];
    let footer = encryption.decrypt(sealed, key)?;
    if footer.len() % FOOTER_ENTRY_SIZE != 0 {
        return Err(PackfileError::Corruption(
            "footer length is not a multiple of the entry size".to_string(),
        ));
    }
    let mut entries = Vec::with_capacity(footer.len() / FOOTER_ENTRY_SIZE);
    let mut cursor = Cursor::new(&footer[..]);
    for _ in 0..footer.len() / FOOTER_ENTRY_SIZE {
        entries.push(PackfileEntry::from_read(&mut cursor)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        Key::random()
    }

    fn mac_of(kind: ResourceKind, data: &[u8], key: &Key) -> Mac {
        MacAlgorithm::Blake3Keyed.mac(kind, data, key.mac_key())
    }

    #[test]
    fn write_read_round_trip() {
        let key = test_key();
        let mut writer = PackfileWriter::new(
            Compression::Zstd { level: 1 },
            Encryption::Aes256GcmSiv,
            key.clone(),
        );
        let blobs: Vec<Vec<u8>> = vec![
            b"first blob".to_vec(),
            vec![0_u8; 4096],
            b"third".to_vec(),
        ];
        let mut macs = Vec::new();
        for blob in &blobs {
            let mac = mac_of(ResourceKind::Chunk, blob, &key);
            assert!(writer.put(ResourceKind::Chunk, mac, blob).unwrap());
            macs.push(mac);
        }
        let (pack, index) = writer.finish().unwrap();
        assert_eq!(index.len(), 3);

        for (entry, blob) in index.iter().zip(blobs.iter()) {
            let record =
                &pack[entry.offset as usize..entry.offset as usize + entry.length as usize];
            let plaintext = read_record(
                record,
                entry.kind,
                &entry.mac,
                Compression::Zstd { level: 1 },
                Encryption::Aes256GcmSiv,
                MacAlgorithm::Blake3Keyed,
                &key,
            )
            .unwrap();
            assert_eq!(&plaintext, blob);
        }

        let footer = read_footer(&pack, Encryption::Aes256GcmSiv, &key).unwrap();
        assert_eq!(footer, index);
    }

    #[test]
    fn duplicate_records_are_dropped() {
        let key = test_key();
        let mut writer =
            PackfileWriter::new(Compression::None, Encryption::None, key.clone());
        let blob = b"stored once".to_vec();
        let mac = mac_of(ResourceKind::Chunk, &blob, &key);
        assert!(writer.put(ResourceKind::Chunk, mac, &blob).unwrap());
        assert!(!writer.put(ResourceKind::Chunk, mac, &blob).unwrap());
        assert_eq!(writer.blob_count(), 1);
        // the same bytes under another kind are a different blob
        let object_mac = mac_of(ResourceKind::Object, &blob, &key);
        assert!(writer.put(ResourceKind::Object, object_mac, &blob).unwrap());
    }

    #[test]
    fn corrupted_record_is_detected() {
        let key = test_key();
        let mut writer = PackfileWriter::new(
            Compression::None,
            Encryption::Aes256GcmSiv,
            key.clone(),
        );
        let blob = b"to be mangled".to_vec();
        let mac = mac_of(ResourceKind::Chunk, &blob, &key);
        writer.put(ResourceKind::Chunk, mac, &blob).unwrap();
        let (mut pack, index) = writer.finish().unwrap();
        pack[0] ^= 0xff;
        let entry = index[0];
        let record =
            &pack[entry.offset as usize..entry.offset as usize + entry.length as usize];
        assert!(read_record(
            record,
            entry.kind,
            &entry.mac,
            Compression::None,
            Encryption::Aes256GcmSiv,
            MacAlgorithm::Blake3Keyed,
            &key,
        )
        .is_err());
    }

    #[test]
    fn wrong_identity_is_corruption() {
        // an honest record handed out under the wrong MAC must not pass
        let key = test_key();
        let mut writer =
            PackfileWriter::new(Compression::None, Encryption::None, key.clone());
        let blob = b"honest bytes".to_vec();
        let mac = mac_of(ResourceKind::Chunk, &blob, &key);
        writer.put(ResourceKind::Chunk, mac, &blob).unwrap();
        let (pack, index) = writer.finish().unwrap();
        let entry = index[0];
        let record =
            &pack[entry.offset as usize..entry.offset as usize + entry.length as usize];
        let other = Mac::new(&[42_u8; 32]);
        match read_record(
            record,
            entry.kind,
            &other,
            Compression::None,
            Encryption::None,
            MacAlgorithm::Blake3Keyed,
            &key,
        ) {
            Err(PackfileError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other.map(|_| ())),
        }
    }
}
