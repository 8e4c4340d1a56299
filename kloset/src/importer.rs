/*!
The importer contract: how data sources feed the snapshot builder.

An importer walks some source (a directory tree, an inbox, a stream) in
its own producer thread and emits [`ScanResult`] records over a bounded
channel. File contents travel as *reader factories* rather than open
handles, so the number of concurrently open readers is bounded by the
builder's worker count, not by the source's size. A factory is called at
most once; closing whatever it returns is the builder's responsibility.

The producer closes the channel by dropping its sender when the scan ends.
*/

pub mod filesystem;
pub mod stdin;

use crate::vfs::FileInfo;

use crossbeam_channel::Receiver;
use thiserror::Error;

use std::io::Read;

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("importer error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ImporterError>;

/// Opens the content stream of a record. Called zero or one times.
pub type ReaderFactory = Box<dyn FnOnce() -> std::io::Result<Box<dyn Read + Send>> + Send>;

/// What kind of record the importer produced.
pub enum RecordKind {
    Directory,
    Regular,
    Symlink,
    /// One extended attribute of `pathname`; the record's reader yields
    /// the attribute value.
    Xattr { name: String },
}

/// One scanned pathname.
pub struct ScanRecord {
    pub pathname: String,
    pub kind: RecordKind,
    pub info: FileInfo,
    /// Symlink target, for symlink records.
    pub target: Option<String>,
    /// Names of the extended attributes this pathname carries; each one
    /// arrives as its own `Xattr` record.
    pub xattr_names: Vec<String>,
    /// Content factory for regular and xattr records.
    pub reader: Option<ReaderFactory>,
}

/// A pathname the importer could not read.
#[derive(Debug, Clone)]
pub struct ScanError {
    pub pathname: String,
    pub message: String,
}

/// The sum type flowing over the scan channel.
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

/// A data source the snapshot builder can drain.
pub trait Importer: Send {
    /// Identifies the source instance, e.g. `fs:///home/op`.
    fn origin(&self) -> String;

    /// Identifies the backend type, e.g. `"fs"`.
    fn type_name(&self) -> &'static str;

    /// The root all record pathnames are relative to.
    fn root(&self) -> String;

    /// Starts the scan and returns the record channel. The channel closes
    /// when the scan is complete.
    fn scan(&mut self) -> Result<Receiver<ScanResult>>;

    /// Releases whatever the importer holds.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
