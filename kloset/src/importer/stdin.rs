//! The stdin importer: snapshots a single stream as one regular file.

use super::{Importer, RecordKind, Result, ScanRecord, ScanResult};
use crate::vfs::FileInfo;

use crossbeam_channel::{bounded, Receiver};

use std::io::Read;

pub struct StdinImporter {
    pathname: String,
}

impl StdinImporter {
    /// `name` is the pathname the stream appears under in the snapshot,
    /// e.g. `backup.sql`.
    pub fn new(name: &str) -> StdinImporter {
        let trimmed = name.trim_start_matches('/');
        StdinImporter {
            pathname: format!("/{}", if trimmed.is_empty() { "stdin" } else { trimmed }),
        }
    }
}

impl Importer for StdinImporter {
    fn origin(&self) -> String {
        "stdin://".to_string()
    }

    fn type_name(&self) -> &'static str {
        "stdin"
    }

    fn root(&self) -> String {
        "/".to_string()
    }

    fn scan(&mut self) -> Result<Receiver<ScanResult>> {
        let (tx, rx) = bounded(2);
        tx.send(ScanResult::Record(ScanRecord {
            pathname: "/".to_string(),
            kind: RecordKind::Directory,
            info: FileInfo::synthetic(0, 0o755),
            target: None,
            xattr_names: Vec::new(),
            reader: None,
        }))
        .expect("bounded(2) holds the directory record");
        tx.send(ScanResult::Record(ScanRecord {
            pathname: self.pathname.clone(),
            kind: RecordKind::Regular,
            info: FileInfo::synthetic(0, 0o644),
            target: None,
            xattr_names: Vec::new(),
            reader: Some(Box::new(|| {
                Ok(Box::new(std::io::stdin()) as Box<dyn Read + Send>)
            })),
        }))
        .expect("bounded(2) holds the file record");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_root_and_file() {
        let mut importer = StdinImporter::new("dump.sql");
        let rx = importer.scan().unwrap();
        let records: Vec<_> = rx
            .into_iter()
            .map(|r| match r {
                ScanResult::Record(record) => record.pathname,
                ScanResult::Error(e) => panic!("unexpected error: {:?}", e),
            })
            .collect();
        assert_eq!(records, vec!["/", "/dump.sql"]);
    }
}
