/*!
The single-file archive store.

Layers the [`Store`] contract over the ptar framing from
`kloset_core::ptar`: one file holding the configuration, a packfile
region, a state region, and the fixed 48-byte trailer. The packfile and
state regions are sequences of `[mac][length u64 LE][payload]` frames so
the store can enumerate its MAC-addressed blobs when the archive is
reopened.

A ptar is write-once: it is populated by exactly one transaction (all
packfiles, then the states, then the trailer on close) and is read-only
ever after. Attempts to interleave regions or write after finalization
fail with `NotWritable`.
*/

use super::{Mode, Result, Store, StoreError};

use kloset_core::mac::{Mac, MAC_SIZE};
use kloset_core::ptar::{self, PtarError, Trailer};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::debug;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Frame overhead: the MAC plus the length word.
const FRAME_HEADER: u64 = MAC_SIZE as u64 + 8;

pub fn factory(location: &str) -> Result<Box<dyn Store>> {
    Ok(Box::new(PtarStore::new(location)))
}

impl From<PtarError> for StoreError {
    fn from(err: PtarError) -> StoreError {
        match err {
            PtarError::InvalidMagic => StoreError::InvalidMagic,
            PtarError::UnsupportedVersion(v) => {
                StoreError::Transport(format!("unsupported ptar version {}", v))
            }
            PtarError::Io(e) => StoreError::Io(e),
        }
    }
}

#[derive(Debug)]
struct Writer {
    file: fs::File,
    trailer: Trailer,
    state_started: bool,
}

#[derive(Debug)]
struct Reader {
    file: fs::File,
    config: Vec<u8>,
    packfiles: HashMap<Mac, (u64, u64)>,
    states: HashMap<Mac, (u64, u64)>,
}

#[derive(Debug)]
enum State {
    Idle,
    Writing(Writer),
    Reading(Reader),
}

#[derive(Debug)]
pub struct PtarStore {
    path: PathBuf,
    inner: Mutex<State>,
}

impl PtarStore {
    pub fn new(path: impl AsRef<Path>) -> PtarStore {
        PtarStore {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(State::Idle),
        }
    }

    fn append_frame(writer: &mut Writer, mac: &Mac, data: &[u8]) -> Result<u64> {
        let end = writer.file.seek(SeekFrom::End(0))?;
        writer.file.write_all(mac.as_bytes())?;
        writer.file.write_u64::<LittleEndian>(data.len() as u64)?;
        writer.file.write_all(data)?;
        debug_assert_eq!(
            writer.file.seek(SeekFrom::Current(0))?,
            end + FRAME_HEADER + data.len() as u64
        );
        Ok(data.len() as u64)
    }

    fn read_frames(file: &mut fs::File, offset: i64, length: i64) -> Result<HashMap<Mac, (u64, u64)>> {
        let mut frames = HashMap::new();
        let mut pos = offset as u64;
        let end = (offset + length) as u64;
        while pos < end {
            file.seek(SeekFrom::Start(pos))?;
            let mut mac = [0_u8; MAC_SIZE];
            file.read_exact(&mut mac)?;
            let len = file.read_u64::<LittleEndian>()?;
            frames.insert(Mac::from_bytes(mac), (pos + FRAME_HEADER, len));
            pos += FRAME_HEADER + len;
        }
        if pos != end {
            return Err(StoreError::Transport(
                "ptar region frames overrun the region boundary".to_string(),
            ));
        }
        Ok(frames)
    }

    fn read_payload(file: &mut fs::File, offset: u64, length: u64) -> Result<Vec<u8>> {
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0_u8; length as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

impl Store for PtarStore {
    fn location(&self) -> String {
        format!("ptar://{}", self.path.display())
    }

    fn mode(&self) -> Mode {
        match &*self.inner.lock() {
            State::Writing(_) => Mode::Write,
            _ => Mode::Read,
        }
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(&*inner, State::Idle) {
            return Err(StoreError::NotWritable(
                "ptar is already open".to_string(),
            ));
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StoreError::NotWritable(format!(
                        "an archive already exists at {}",
                        self.path.display()
                    ))
                } else {
                    StoreError::Io(e)
                }
            })?;
        ptar::write_header(&mut file)?;
        file.write_all(config)?;
        let trailer = Trailer {
            config_offset: ptar::HEADER_SIZE as i64,
            config_length: config.len() as i64,
            packfile_offset: ptar::HEADER_SIZE as i64 + config.len() as i64,
            packfile_length: 0,
            state_offset: 0,
            state_length: 0,
        };
        debug!(path = %self.path.display(), "created ptar archive");
        *inner = State::Writing(Writer {
            file,
            trailer,
            state_started: false,
        });
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match &*inner {
            State::Reading(reader) => return Ok(reader.config.clone()),
            State::Writing(_) => {
                return Err(StoreError::NotWritable(
                    "ptar is open for writing".to_string(),
                ))
            }
            State::Idle => {}
        }
        let mut file = fs::File::open(&self.path).map_err(super::map_not_found)?;
        ptar::read_header(&mut file)?;
        file.seek(SeekFrom::End(-(ptar::TRAILER_SIZE as i64)))?;
        let trailer = Trailer::from_read(&mut file)?;
        let config = Self::read_payload(
            &mut file,
            trailer.config_offset as u64,
            trailer.config_length as u64,
        )?;
        let packfiles =
            Self::read_frames(&mut file, trailer.packfile_offset, trailer.packfile_length)?;
        let states = Self::read_frames(&mut file, trailer.state_offset, trailer.state_length)?;
        let reader = Reader {
            file,
            config: config.clone(),
            packfiles,
            states,
        };
        *inner = State::Reading(reader);
        Ok(config)
    }

    fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0))
    }

    fn list_packfiles(&self) -> Result<Vec<Mac>> {
        match &*self.inner.lock() {
            State::Reading(reader) => Ok(reader.packfiles.keys().copied().collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let writer = match &mut *inner {
            State::Writing(writer) => writer,
            _ => {
                return Err(StoreError::NotWritable(
                    "ptar is not open for writing".to_string(),
                ))
            }
        };
        if writer.state_started {
            return Err(StoreError::NotWritable(
                "packfiles must precede states in a ptar".to_string(),
            ));
        }
        let written = Self::append_frame(writer, &mac, data)?;
        writer.trailer.packfile_length += (FRAME_HEADER + written) as i64;
        Ok(written)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            State::Reading(reader) => {
                let (offset, length) =
                    *reader.packfiles.get(&mac).ok_or(StoreError::NotFound)?;
                Self::read_payload(&mut reader.file, offset, length)
            }
            _ => Err(StoreError::NotFound),
        }
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            State::Reading(reader) => {
                let (base, pack_len) =
                    *reader.packfiles.get(&mac).ok_or(StoreError::NotFound)?;
                if offset + u64::from(length) > pack_len {
                    return Err(StoreError::Transport(format!(
                        "range {}+{} outside packfile of {} bytes",
                        offset, length, pack_len
                    )));
                }
                Self::read_payload(&mut reader.file, base + offset, u64::from(length))
            }
            _ => Err(StoreError::NotFound),
        }
    }

    fn delete_packfile(&self, _mac: Mac) -> Result<()> {
        Err(StoreError::NotWritable(
            "ptar archives are write-once".to_string(),
        ))
    }

    fn list_states(&self) -> Result<Vec<Mac>> {
        match &*self.inner.lock() {
            State::Reading(reader) => Ok(reader.states.keys().copied().collect()),
            _ => Ok(Vec::new()),
        }
    }

    fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let writer = match &mut *inner {
            State::Writing(writer) => writer,
            _ => {
                return Err(StoreError::NotWritable(
                    "ptar is not open for writing".to_string(),
                ))
            }
        };
        if !writer.state_started {
            writer.state_started = true;
            writer.trailer.state_offset =
                writer.trailer.packfile_offset + writer.trailer.packfile_length;
        }
        let written = Self::append_frame(writer, &mac, data)?;
        writer.trailer.state_length += (FRAME_HEADER + written) as i64;
        Ok(written)
    }

    fn get_state(&self, mac: Mac) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            State::Reading(reader) => {
                let (offset, length) = *reader.states.get(&mac).ok_or(StoreError::NotFound)?;
                Self::read_payload(&mut reader.file, offset, length)
            }
            _ => Err(StoreError::NotFound),
        }
    }

    fn delete_state(&self, _mac: Mac) -> Result<()> {
        Err(StoreError::NotWritable(
            "ptar archives are write-once".to_string(),
        ))
    }

    // A ptar is populated by a single writer and read-only afterwards;
    // advisory locks have nothing to protect, so they are accepted and
    // discarded.
    fn list_locks(&self) -> Result<Vec<Mac>> {
        Ok(Vec::new())
    }

    fn put_lock(&self, _mac: Mac, data: &[u8]) -> Result<u64> {
        Ok(data.len() as u64)
    }

    fn get_lock(&self, _mac: Mac) -> Result<Vec<u8>> {
        Err(StoreError::NotFound)
    }

    fn delete_lock(&self, _mac: Mac) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let State::Writing(writer) = &mut *inner {
            // a packfile-only archive still records an empty state region
            if !writer.state_started {
                writer.trailer.state_offset =
                    writer.trailer.packfile_offset + writer.trailer.packfile_length;
            }
            writer.file.seek(SeekFrom::End(0))?;
            writer.trailer.to_write(&mut writer.file)?;
            writer.file.sync_all()?;
            debug!(path = %self.path.display(), "finalized ptar archive");
            *inner = State::Idle;
        }
        Ok(())
    }
}
