//! Single-file archive creation, layout, and restore.

use kloset::events::EventBus;
use kloset::exporter::filesystem::FilesystemExporter;
use kloset::importer::filesystem::FilesystemImporter;
use kloset::snapshot::builder::{backup, BackupOptions};
use kloset::snapshot::restore::{restore, RestoreOptions};
use kloset::snapshot::{self};
use kloset::store::open_store;
use kloset::{CancelToken, Compression, Config, Encryption, Key, MacAlgorithm, Repository};

use kloset_core::config::KeySlot;
use kloset_core::ptar::{Trailer, TRAILER_SIZE};

use std::fs;
use std::path::Path;

fn make_source(root: &Path) {
    fs::create_dir_all(root.join("subdir")).unwrap();
    fs::create_dir_all(root.join("another_subdir")).unwrap();
    fs::write(root.join("subdir/dummy.txt"), b"hello dummy").unwrap();
    fs::write(root.join("subdir/foo.txt"), b"hello foo").unwrap();
    fs::write(root.join("another_subdir/bar"), b"hello bar").unwrap();
}

// Creates a ptar archive from a directory, returning the config length
// for layout assertions.
fn create_ptar(archive: &Path, source: &Path, key: &Key) -> i64 {
    let config = Config::new(
        MacAlgorithm::Blake3Keyed,
        Encryption::Aes256GcmSiv,
        Compression::Zstd { level: 3 },
        KeySlot::Plain(key.clone()),
    );
    let config_len = config.to_bytes().unwrap().len() as i64;

    let store = open_store(&format!("ptar://{}", archive.display())).unwrap();
    let repo = Repository::create(store, config, key.clone()).unwrap();
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source);
    backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();
    repo.close().unwrap();
    config_len
}

#[test]
fn trailer_layout() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    make_source(&source);
    let archive = dir.path().join("backup.ptar");
    let config_len = create_ptar(&archive, &source, &Key::random());

    let bytes = fs::read(&archive).unwrap();
    let trailer =
        Trailer::from_read(&bytes[bytes.len() - TRAILER_SIZE as usize..]).unwrap();

    assert_eq!(trailer.config_offset, 12);
    assert!(trailer.config_length > 0);
    assert_eq!(trailer.config_length, config_len);
    assert_eq!(trailer.packfile_offset, 12 + trailer.config_length);
    assert!(trailer.packfile_length > 0);
    assert_eq!(
        trailer.state_offset,
        trailer.packfile_offset + trailer.packfile_length
    );
    assert!(trailer.state_length > 0);
    assert_eq!(
        bytes.len() as i64,
        trailer.state_offset + trailer.state_length + TRAILER_SIZE as i64
    );
}

#[test]
fn ptar_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    make_source(&source);
    let archive = dir.path().join("backup.ptar");
    let key = Key::random();
    create_ptar(&archive, &source, &key);

    // reopen the archive read-only and restore from it
    let store = open_store(&format!("ptar://{}", archive.display())).unwrap();
    let repo = Repository::open(store, None).unwrap();
    let snapshots = snapshot::list_headers(&repo).unwrap();
    assert_eq!(snapshots.len(), 1);
    let (mac, header) = &snapshots[0];
    assert_eq!(header.summary.files, 3);
    assert_eq!(header.summary.directories, 2);

    let target = dir.path().join("restored");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut exporter = FilesystemExporter::new(&target);
    restore(
        &repo,
        mac,
        &RestoreOptions::default(),
        &mut exporter,
        &events,
        &cancel,
    )
    .unwrap();

    for (path, content) in [
        ("subdir/dummy.txt", "hello dummy"),
        ("subdir/foo.txt", "hello foo"),
        ("another_subdir/bar", "hello bar"),
    ]
    .iter()
    {
        assert_eq!(
            fs::read(target.join(path)).unwrap(),
            content.as_bytes(),
            "mismatch at {}",
            path
        );
    }
}
