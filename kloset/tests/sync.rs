//! Synchronizing snapshots across repositories.

use kloset::events::EventBus;
use kloset::importer::filesystem::FilesystemImporter;
use kloset::snapshot::builder::{backup, BackupOptions};
use kloset::snapshot::check::check_snapshot;
use kloset::snapshot::sync::{sync_all, sync_snapshot};
use kloset::snapshot::{self, SnapshotError};
use kloset::store::memory::MemoryStore;
use kloset::{CancelToken, Compression, Config, Encryption, Key, MacAlgorithm, Repository};

use kloset_core::config::KeySlot;

use std::fs;

fn repo_with_key(name: &str, key: Key) -> Repository {
    let config = Config::new(
        MacAlgorithm::Blake3Keyed,
        Encryption::Aes256GcmSiv,
        Compression::Zstd { level: 1 },
        KeySlot::Plain(key.clone()),
    );
    Repository::create(Box::new(MemoryStore::new(name)), config, key).unwrap()
}

fn backup_sample(repo: &Repository) -> kloset::Mac {
    let source = tempfile::tempdir().unwrap();
    fs::create_dir_all(source.path().join("d")).unwrap();
    fs::write(source.path().join("d/one.txt"), b"first file").unwrap();
    fs::write(source.path().join("two.txt"), b"second file").unwrap();

    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, _header) = backup(
        repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();
    mac
}

#[test]
fn synced_snapshot_is_whole_in_the_destination() {
    // same MAC key material on both sides, different repositories
    let key = Key::random();
    let src = repo_with_key("sync-src", key.clone());
    let dst = repo_with_key("sync-dst", key);
    let mac = backup_sample(&src);

    let cancel = CancelToken::new();
    let copied = sync_snapshot(&src, &dst, &mac, &cancel).unwrap();
    assert!(copied > 0);

    // the destination now serves the snapshot on its own
    let headers = snapshot::list_headers(&dst).unwrap();
    assert_eq!(headers.len(), 1);
    let report = check_snapshot(&dst, &mac, &cancel).unwrap();
    assert!(report.ok(), "issues: {:?}", report.issues);

    // syncing again copies nothing
    assert_eq!(sync_snapshot(&src, &dst, &mac, &cancel).unwrap(), 0);
}

#[test]
fn sync_all_copies_every_missing_snapshot() {
    let key = Key::random();
    let src = repo_with_key("sync-all-src", key.clone());
    let dst = repo_with_key("sync-all-dst", key);
    backup_sample(&src);
    backup_sample(&src);

    let cancel = CancelToken::new();
    sync_all(&src, &dst, &cancel).unwrap();
    assert_eq!(
        snapshot::list_headers(&dst).unwrap().len(),
        snapshot::list_headers(&src).unwrap().len()
    );
}

#[test]
fn different_mac_keys_refuse_to_sync() {
    let src = repo_with_key("sync-badkey-src", Key::random());
    let dst = repo_with_key("sync-badkey-dst", Key::random());
    let mac = backup_sample(&src);

    let cancel = CancelToken::new();
    match sync_snapshot(&src, &dst, &mac, &cancel) {
        Err(SnapshotError::KeyMismatch) => {}
        other => panic!("expected KeyMismatch, got {:?}", other.map(|_| ())),
    }
}
