//! Exercises the importer contract with a synthetic source: extended
//! attributes, scan errors, and cancellation.

use kloset::events::EventBus;
use kloset::importer::{
    Importer, RecordKind, Result as ImporterResult, ScanError, ScanRecord, ScanResult,
};
use kloset::snapshot::builder::{backup, BackupOptions};
use kloset::snapshot::{self, SnapshotError};
use kloset::store::memory::MemoryStore;
use kloset::vfs::FileInfo;
use kloset::{CancelToken, Compression, Config, Encryption, Key, MacAlgorithm, Repository};

use kloset_core::config::KeySlot;

use crossbeam_channel::{bounded, Receiver};

use std::io::Cursor;

struct SyntheticImporter {
    results: Vec<ScanResult>,
}

impl SyntheticImporter {
    fn new(results: Vec<ScanResult>) -> SyntheticImporter {
        SyntheticImporter { results }
    }
}

impl Importer for SyntheticImporter {
    fn origin(&self) -> String {
        "synthetic://test".to_string()
    }

    fn type_name(&self) -> &'static str {
        "synthetic"
    }

    fn root(&self) -> String {
        "/".to_string()
    }

    fn scan(&mut self) -> ImporterResult<Receiver<ScanResult>> {
        let results = std::mem::take(&mut self.results);
        let (tx, rx) = bounded(results.len().max(1));
        for result in results {
            tx.send(result).expect("channel sized to fit");
        }
        Ok(rx)
    }
}

fn dir(pathname: &str) -> ScanResult {
    ScanResult::Record(ScanRecord {
        pathname: pathname.to_string(),
        kind: RecordKind::Directory,
        info: FileInfo::synthetic(0, 0o755),
        target: None,
        xattr_names: Vec::new(),
        reader: None,
    })
}

fn file(pathname: &str, body: &'static [u8], xattr_names: Vec<String>) -> ScanResult {
    ScanResult::Record(ScanRecord {
        pathname: pathname.to_string(),
        kind: RecordKind::Regular,
        info: FileInfo::synthetic(body.len() as u64, 0o644),
        target: None,
        xattr_names,
        reader: Some(Box::new(move || Ok(Box::new(Cursor::new(body)) as _))),
    })
}

fn xattr(pathname: &str, name: &str, value: &'static [u8]) -> ScanResult {
    ScanResult::Record(ScanRecord {
        pathname: pathname.to_string(),
        kind: RecordKind::Xattr {
            name: name.to_string(),
        },
        info: FileInfo::synthetic(value.len() as u64, 0),
        target: None,
        xattr_names: Vec::new(),
        reader: Some(Box::new(move || Ok(Box::new(Cursor::new(value)) as _))),
    })
}

fn fresh_repo(name: &str) -> Repository {
    let key = Key::random();
    let config = Config::new(
        MacAlgorithm::Blake3Keyed,
        Encryption::Aes256GcmSiv,
        Compression::Lz4 { level: 1 },
        KeySlot::Plain(key.clone()),
    );
    Repository::create(Box::new(MemoryStore::new(name)), config, key).unwrap()
}

#[test]
fn xattrs_and_errors_are_indexed() {
    let repo = fresh_repo("synthetic-xattrs");
    let mut importer = SyntheticImporter::new(vec![
        dir("/"),
        file("/data.bin", b"file body", vec!["user.comment".to_string()]),
        xattr("/data.bin", "user.comment", b"a remark"),
        ScanResult::Error(ScanError {
            pathname: "/broken".to_string(),
            message: "device unreachable".to_string(),
        }),
    ]);

    let events = EventBus::new();
    let cancel = CancelToken::new();
    let (mac, header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();

    assert_eq!(header.summary.files, 1);
    assert_eq!(header.summary.xattrs, 1);
    assert_eq!(header.summary.errors, 1);

    let header = snapshot::get_header(&repo, &mac).unwrap();
    let mut vfs = snapshot::open_vfs(&repo, &header).unwrap();

    let entry = vfs.lookup("/data.bin").unwrap();
    assert_eq!(entry.xattr_names, vec!["user.comment"]);

    let attr = vfs.xattr("/data.bin", "user.comment").unwrap();
    assert_eq!(attr.name, "user.comment");
    assert_eq!(attr.size, 8);

    let errors = vfs.errors().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "/broken");
    assert_eq!(errors[0].1, "device unreachable");
}

#[test]
fn cancellation_aborts_without_committing() {
    let repo = fresh_repo("synthetic-cancel");
    let mut importer = SyntheticImporter::new(vec![dir("/"), file("/f", b"body", Vec::new())]);

    let events = EventBus::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    match backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    ) {
        Err(SnapshotError::Canceled) => {}
        other => panic!("expected Canceled, got {:?}", other.map(|_| ())),
    }
    assert!(repo.snapshots().is_empty());
}
