/*!
The single-file archive ("ptar") framing.

A ptar packs a whole repository into one seekable file:

```text
magic    [8]  b"_PLATAR_"
version  u32  LE
config   bytes
packfile region
state    region
trailer  48 bytes, six i64 LE:
         configOffset, configLength,
         packfileOffset, packfileLength,
         stateOffset, stateLength
```

A reader seeks 48 bytes from the end, parses the trailer, and addresses the
three regions directly; a ranged-read transport can do the same with range
requests. Region contents are defined by the store implementation layered on
top of this module.
*/

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use std::io::{Read, Write};

pub const MAGIC: [u8; 8] = *b"_PLATAR_";
pub const VERSION: u32 = 1;

/// Byte length of the fixed header (magic plus version).
pub const HEADER_SIZE: u64 = 12;

/// Byte length of the fixed trailer.
pub const TRAILER_SIZE: u64 = 48;

#[derive(Error, Debug)]
pub enum PtarError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("magic number is not correct for the ptar format")]
    InvalidMagic,
    #[error("unsupported ptar version {0}")]
    UnsupportedVersion(u32),
}

type Result<T> = std::result::Result<T, PtarError>;

/// Writes the fixed header. The provided `Write` must be positioned at the
/// start of the file.
pub fn write_header(mut write: impl Write) -> Result<()> {
    write.write_all(&MAGIC)?;
    write.write_u32::<LittleEndian>(VERSION)?;
    Ok(())
}

/// Reads and validates the fixed header, returning the format version.
pub fn read_header(mut read: impl Read) -> Result<u32> {
    let mut magic = [0_u8; 8];
    read.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(PtarError::InvalidMagic);
    }
    let version = read.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(PtarError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// The region directory at the end of every ptar.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Trailer {
    pub config_offset: i64,
    pub config_length: i64,
    pub packfile_offset: i64,
    pub packfile_length: i64,
    pub state_offset: i64,
    pub state_length: i64,
}

impl Trailer {
    pub fn to_write(&self, mut write: impl Write) -> Result<()> {
        write.write_i64::<LittleEndian>(self.config_offset)?;
        write.write_i64::<LittleEndian>(self.config_length)?;
        write.write_i64::<LittleEndian>(self.packfile_offset)?;
        write.write_i64::<LittleEndian>(self.packfile_length)?;
        write.write_i64::<LittleEndian>(self.state_offset)?;
        write.write_i64::<LittleEndian>(self.state_length)?;
        Ok(())
    }

    pub fn from_read(mut read: impl Read) -> Result<Trailer> {
        Ok(Trailer {
            config_offset: read.read_i64::<LittleEndian>()?,
            config_length: read.read_i64::<LittleEndian>()?,
            packfile_offset: read.read_i64::<LittleEndian>()?,
            packfile_length: read.read_i64::<LittleEndian>()?,
            state_offset: read.read_i64::<LittleEndian>()?,
            state_length: read.read_i64::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let mut buffer = Vec::new();
        write_header(&mut buffer).unwrap();
        assert_eq!(buffer.len() as u64, HEADER_SIZE);
        assert_eq!(read_header(Cursor::new(&buffer)).unwrap(), VERSION);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buffer = b"NOT_PTAR\x01\x00\x00\x00".to_vec();
        match read_header(Cursor::new(&buffer)) {
            Err(PtarError::InvalidMagic) => {}
            other => panic!("expected InvalidMagic, got {:?}", other),
        }
    }

    #[test]
    fn trailer_round_trip() {
        let trailer = Trailer {
            config_offset: 12,
            config_length: 345,
            packfile_offset: 357,
            packfile_length: 1000,
            state_offset: 1357,
            state_length: 99,
        };
        let mut buffer = Vec::new();
        trailer.to_write(&mut buffer).unwrap();
        assert_eq!(buffer.len() as u64, TRAILER_SIZE);
        assert_eq!(Trailer::from_read(Cursor::new(&buffer)).unwrap(), trailer);
    }
}
