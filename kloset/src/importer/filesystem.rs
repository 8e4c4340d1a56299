//! The filesystem importer.
//!
//! Walks a directory tree in a producer thread and streams records over a
//! bounded channel. Pathnames are emitted relative to the scan root, with
//! the root itself showing up as `/`.

use super::{
    Importer, ImporterError, ReaderFactory, RecordKind, Result, ScanError, ScanRecord,
    ScanResult,
};
use crate::vfs::FileInfo;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver};
use tracing::debug;
use walkdir::WalkDir;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

/// Records in flight between the walker thread and the builder.
const SCAN_QUEUE_DEPTH: usize = 256;

pub struct FilesystemImporter {
    root: PathBuf,
}

impl FilesystemImporter {
    pub fn new(root: impl AsRef<Path>) -> FilesystemImporter {
        FilesystemImporter {
            root: root.as_ref().to_path_buf(),
        }
    }
}

fn file_info(metadata: &fs::Metadata) -> FileInfo {
    let mtime: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileInfo {
            size: metadata.len(),
            mode: metadata.mode(),
            mtime,
            uid: metadata.uid(),
            gid: metadata.gid(),
            nlink: metadata.nlink() as u32,
            username: String::new(),
            groupname: String::new(),
        }
    }
    #[cfg(not(unix))]
    {
        FileInfo {
            size: metadata.len(),
            mode: if metadata.is_dir() { 0o755 } else { 0o644 },
            mtime,
            uid: 0,
            gid: 0,
            nlink: 1,
            username: String::new(),
            groupname: String::new(),
        }
    }
}

// Maps an on-disk path below `root` to its snapshot pathname.
fn pathname_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::from("/");
    let mut first = true;
    for component in relative.components() {
        let part = component.as_os_str().to_str()?;
        if !first {
            out.push('/');
        }
        out.push_str(part);
        first = false;
    }
    Some(out)
}

fn reader_for(path: PathBuf) -> ReaderFactory {
    Box::new(move || {
        let file = fs::File::open(&path)?;
        Ok(Box::new(file) as Box<dyn Read + Send>)
    })
}

impl Importer for FilesystemImporter {
    fn origin(&self) -> String {
        format!("fs://{}", self.root.display())
    }

    fn type_name(&self) -> &'static str {
        "fs"
    }

    fn root(&self) -> String {
        self.root.display().to_string()
    }

    fn scan(&mut self) -> Result<Receiver<ScanResult>> {
        if !self.root.exists() {
            return Err(ImporterError::Other(format!(
                "scan root {} does not exist",
                self.root.display()
            )));
        }
        let root = self.root.clone();
        let (tx, rx) = bounded(SCAN_QUEUE_DEPTH);
        thread::Builder::new()
            .name("kloset-fs-scan".to_string())
            .spawn(move || {
                debug!(root = %root.display(), "filesystem scan started");
                for item in WalkDir::new(&root).follow_links(false) {
                    let entry = match item {
                        Ok(entry) => entry,
                        Err(e) => {
                            let pathname = e
                                .path()
                                .and_then(|p| pathname_of(&root, p))
                                .unwrap_or_else(|| "/".to_string());
                            let result = ScanResult::Error(ScanError {
                                pathname,
                                message: e.to_string(),
                            });
                            if tx.send(result).is_err() {
                                return;
                            }
                            continue;
                        }
                    };
                    let pathname = match pathname_of(&root, entry.path()) {
                        Some(pathname) => pathname,
                        None => continue,
                    };
                    let result = scan_one(&root, &pathname, entry.path());
                    if tx.send(result).is_err() {
                        // the consumer went away, stop walking
                        return;
                    }
                }
            })
            .map_err(|e| ImporterError::Other(format!("cannot spawn scan thread: {}", e)))?;
        Ok(rx)
    }
}

fn scan_one(_root: &Path, pathname: &str, path: &Path) -> ScanResult {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            return ScanResult::Error(ScanError {
                pathname: pathname.to_string(),
                message: e.to_string(),
            })
        }
    };
    let info = file_info(&metadata);
    let file_type = metadata.file_type();
    if file_type.is_dir() {
        ScanResult::Record(ScanRecord {
            pathname: pathname.to_string(),
            kind: RecordKind::Directory,
            info,
            target: None,
            xattr_names: Vec::new(),
            reader: None,
        })
    } else if file_type.is_symlink() {
        match fs::read_link(path) {
            Ok(target) => ScanResult::Record(ScanRecord {
                pathname: pathname.to_string(),
                kind: RecordKind::Symlink,
                info,
                target: Some(target.to_string_lossy().into_owned()),
                xattr_names: Vec::new(),
                reader: None,
            }),
            Err(e) => ScanResult::Error(ScanError {
                pathname: pathname.to_string(),
                message: e.to_string(),
            }),
        }
    } else if file_type.is_file() {
        ScanResult::Record(ScanRecord {
            pathname: pathname.to_string(),
            kind: RecordKind::Regular,
            info,
            target: None,
            xattr_names: Vec::new(),
            reader: Some(reader_for(path.to_path_buf())),
        })
    } else {
        // sockets, fifos, devices: recorded as errors rather than silently
        // skipped
        ScanResult::Error(ScanError {
            pathname: pathname.to_string(),
            message: "unsupported file type".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scans_a_small_tree() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"hello a").unwrap();
        fs::write(dir.path().join("b.txt"), b"hello b").unwrap();

        let mut importer = FilesystemImporter::new(dir.path());
        let rx = importer.scan().unwrap();
        let mut paths = Vec::new();
        let mut contents = Vec::new();
        for result in rx {
            match result {
                ScanResult::Record(record) => {
                    paths.push(record.pathname.clone());
                    if let Some(open) = record.reader {
                        let mut body = String::new();
                        open().unwrap().read_to_string(&mut body).unwrap();
                        contents.push((record.pathname, body));
                    }
                }
                ScanResult::Error(e) => panic!("unexpected scan error: {:?}", e),
            }
        }
        paths.sort();
        assert_eq!(paths, vec!["/", "/b.txt", "/sub", "/sub/a.txt"]);
        contents.sort();
        assert_eq!(
            contents,
            vec![
                ("/b.txt".to_string(), "hello b".to_string()),
                ("/sub/a.txt".to_string(), "hello a".to_string()),
            ]
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let mut importer = FilesystemImporter::new("/definitely/not/here");
        assert!(importer.scan().is_err());
    }
}
