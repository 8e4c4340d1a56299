//! End-to-end backup and restore over real filesystems.

use kloset::events::EventBus;
use kloset::exporter::filesystem::FilesystemExporter;
use kloset::importer::filesystem::FilesystemImporter;
use kloset::snapshot::builder::{backup, BackupOptions};
use kloset::snapshot::check::check_snapshot;
use kloset::snapshot::restore::{restore, RestoreOptions};
use kloset::snapshot::{self};
use kloset::store::memory::MemoryStore;
use kloset::vfs::EntryKind;
use kloset::{CancelToken, Compression, Config, Encryption, Key, MacAlgorithm, Repository};

use kloset_core::config::KeySlot;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn fresh_repo(name: &str) -> Repository {
    let key = Key::random();
    let config = Config::new(
        MacAlgorithm::Blake3Keyed,
        Encryption::Aes256GcmSiv,
        Compression::Zstd { level: 3 },
        KeySlot::Plain(key.clone()),
    );
    Repository::create(Box::new(MemoryStore::new(name)), config, key).unwrap()
}

fn make_source(root: &Path) {
    fs::create_dir_all(root.join("subdir")).unwrap();
    fs::create_dir_all(root.join("another_subdir")).unwrap();
    fs::write(root.join("subdir/dummy.txt"), b"hello dummy").unwrap();
    fs::write(root.join("subdir/foo.txt"), b"hello foo").unwrap();
    fs::write(root.join("another_subdir/bar"), b"hello bar").unwrap();
}

fn tree_of(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir(root) {
        let rel = entry.strip_prefix(root).unwrap().to_str().unwrap().to_string();
        if entry.is_file() {
            out.insert(rel, fs::read(&entry).unwrap());
        } else if entry.is_dir() && entry != root {
            out.insert(rel, Vec::new());
        }
    }
    out
}

fn walkdir(root: &Path) -> Vec<std::path::PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    let mut out = Vec::new();
    while let Some(dir) = stack.pop() {
        out.push(dir.clone());
        if dir.is_dir() {
            for child in fs::read_dir(&dir).unwrap() {
                stack.push(child.unwrap().path());
            }
        }
    }
    out
}

#[test]
fn backup_then_restore_is_byte_identical() {
    let source = tempfile::tempdir().unwrap();
    make_source(source.path());

    let repo = fresh_repo("e2e-backup-restore");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();

    assert_eq!(header.summary.files, 3);
    assert_eq!(header.summary.directories, 2);
    assert_eq!(header.summary.errors, 0);
    assert_eq!(
        header.summary.total_size,
        ("hello dummy".len() + "hello foo".len() + "hello bar".len()) as u64
    );

    let target = tempfile::tempdir().unwrap();
    let mut exporter = FilesystemExporter::new(target.path());
    let (entries, bytes) = restore(
        &repo,
        &mac,
        &RestoreOptions::default(),
        &mut exporter,
        &events,
        &cancel,
    )
    .unwrap();
    assert_eq!(entries, 6); // root + 2 dirs + 3 files
    assert_eq!(bytes, header.summary.total_size);

    assert_eq!(tree_of(source.path()), tree_of(target.path()));
}

#[test]
fn snapshot_is_listed_and_checks_clean() {
    let source = tempfile::tempdir().unwrap();
    make_source(source.path());

    let repo = fresh_repo("e2e-check");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();

    let listed = snapshot::list_headers(&repo).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, mac);
    assert_eq!(listed[0].1.identifier, header.identifier);

    let report = check_snapshot(&repo, &mac, &cancel).unwrap();
    assert!(report.ok(), "issues: {:?}", report.issues);
    assert_eq!(report.entries, 6);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.bytes, header.summary.total_size);

    // a prefix of the header MAC resolves to the snapshot
    let resolved = snapshot::resolve(&repo, &mac.to_hex()[..12]).unwrap();
    assert_eq!(resolved, mac);
}

#[test]
fn vfs_navigation() {
    let source = tempfile::tempdir().unwrap();
    make_source(source.path());
    #[cfg(unix)]
    std::os::unix::fs::symlink("subdir/foo.txt", source.path().join("link")).unwrap();

    let repo = fresh_repo("e2e-vfs");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, _header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();

    let header = snapshot::get_header(&repo, &mac).unwrap();
    let mut vfs = snapshot::open_vfs(&repo, &header).unwrap();

    let entry = vfs.lookup("/subdir/dummy.txt").unwrap();
    assert_eq!(entry.kind, EntryKind::Regular);
    assert_eq!(entry.info.size, 11);

    let mut names: Vec<String> = vfs
        .read_dir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.pathname)
        .collect();
    names.sort();
    #[cfg(unix)]
    assert_eq!(names, vec!["/another_subdir", "/link", "/subdir"]);
    #[cfg(not(unix))]
    assert_eq!(names, vec!["/another_subdir", "/subdir"]);

    let subdir: Vec<String> = vfs
        .read_dir("/subdir")
        .unwrap()
        .into_iter()
        .map(|e| e.pathname)
        .collect();
    assert_eq!(subdir, vec!["/subdir/dummy.txt", "/subdir/foo.txt"]);

    #[cfg(unix)]
    {
        // lookup follows the symlink to the file it points at
        let through_link = vfs.lookup("/link").unwrap();
        assert_eq!(through_link.pathname, "/subdir/foo.txt");
        // entry() does not follow
        let raw = vfs.entry("/link").unwrap();
        assert_eq!(raw.kind, EntryKind::Symlink);
    }

    assert!(matches!(
        vfs.lookup("/missing"),
        Err(kloset::vfs::VfsError::NotFound)
    ));
    assert!(vfs.errors().unwrap().is_empty());
}

#[test]
fn identical_files_share_their_chunks() {
    let source = tempfile::tempdir().unwrap();
    let body = vec![0x42_u8; 300_000];
    fs::write(source.path().join("one"), &body).unwrap();
    fs::write(source.path().join("two"), &body).unwrap();

    let repo = fresh_repo("e2e-dedup");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();
    assert_eq!(header.summary.files, 2);

    // both files resolve to the same object
    let header = snapshot::get_header(&repo, &mac).unwrap();
    let mut vfs = snapshot::open_vfs(&repo, &header).unwrap();
    let one = vfs.lookup("/one").unwrap();
    let two = vfs.lookup("/two").unwrap();
    assert_eq!(one.object, two.object);
}

#[test]
fn per_file_errors_do_not_abort() {
    let source = tempfile::tempdir().unwrap();
    fs::write(source.path().join("readable"), b"fine").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::write(source.path().join("unreadable"), b"secret").unwrap();
        fs::set_permissions(
            source.path().join("unreadable"),
            fs::Permissions::from_mode(0o000),
        )
        .unwrap();
    }

    let repo = fresh_repo("e2e-errors");
    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(source.path());
    let (mac, header) = backup(
        &repo,
        &mut importer,
        &BackupOptions::default(),
        &events,
        &cancel,
    )
    .unwrap();

    #[cfg(unix)]
    {
        // a root run ignores permission bits and reads both files; either
        // way every path is accounted for and nothing aborted
        assert_eq!(header.summary.files + header.summary.errors, 2);
        if header.summary.errors == 1 {
            let h = snapshot::get_header(&repo, &mac).unwrap();
            let mut vfs = snapshot::open_vfs(&repo, &h).unwrap();
            let errors = vfs.errors().unwrap();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, "/unreadable");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = mac;
        assert_eq!(header.summary.errors, 0);
    }
}
