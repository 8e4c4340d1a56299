/*!
Snapshot verification.

`check_snapshot` walks everything a snapshot references: the three index
trees (structural invariants included), every entry blob, every object,
every chunk, and every extended attribute. The blob layer authenticates
each read against its identifier, so a clean walk means every byte the
snapshot needs is present and intact. Findings are collected into a
report rather than failing fast; one corrupt file should not hide the
next one.
*/

use crate::repository::Repository;
use crate::snapshot::{self, Result, SnapshotError};
use crate::vfs::{EntryKind, Object, Xattr};

use kloset_core::cancel::CancelToken;
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use tracing::{info, instrument};

#[derive(Debug, Default)]
pub struct CheckReport {
    pub entries: u64,
    pub objects: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub issues: Vec<String>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }

    fn issue(&mut self, message: String) {
        self.issues.push(message);
    }
}

/// Verifies one snapshot end to end.
#[instrument(skip(repo, cancel))]
pub fn check_snapshot(
    repo: &Repository,
    snapshot: &Mac,
    cancel: &CancelToken,
) -> Result<CheckReport> {
    let header = snapshot::get_header(repo, snapshot)?;
    let mut vfs = snapshot::open_vfs(repo, &header)?;
    let mut report = CheckReport::default();

    if let Err(e) = vfs.tree().verify() {
        report.issue(format!("path tree: {}", e));
    }
    if let Err(e) = vfs.xattr_tree().verify() {
        report.issue(format!("xattr tree: {}", e));
    }
    if let Err(e) = vfs.error_tree().verify() {
        report.issue(format!("errors tree: {}", e));
    }

    let pairs = vfs.walk(None)?;
    for (pathname, entry_mac) in pairs {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Canceled);
        }
        let entry = match vfs.entry_at(&entry_mac) {
            Ok(entry) => entry,
            Err(e) => {
                report.issue(format!("{}: entry unreadable: {}", pathname, e));
                continue;
            }
        };
        report.entries += 1;
        if entry.kind != EntryKind::Regular {
            continue;
        }
        let object = match vfs.object(&entry) {
            Ok(object) => object,
            Err(e) => {
                report.issue(format!("{}: object unreadable: {}", pathname, e));
                continue;
            }
        };
        report.objects += 1;
        check_object(repo, &pathname, &object, cancel, &mut report)?;
        for name in &entry.xattr_names {
            match vfs.xattr(&pathname, name) {
                Ok(xattr) => check_xattr(repo, &pathname, &xattr, cancel, &mut report)?,
                Err(e) => {
                    report.issue(format!("{}: xattr {} unreadable: {}", pathname, name, e))
                }
            }
        }
    }

    info!(
        entries = report.entries,
        chunks = report.chunks,
        issues = report.issues.len(),
        "snapshot check finished"
    );
    Ok(report)
}

fn check_object(
    repo: &Repository,
    pathname: &str,
    object: &Object,
    cancel: &CancelToken,
    report: &mut CheckReport,
) -> Result<()> {
    let integrity = repo.mac_of(
        ResourceKind::Object,
        &Object::integrity_source(&object.chunks),
    );
    if integrity != object.integrity {
        report.issue(format!("{}: chunk list fails its integrity MAC", pathname));
    }
    for chunk in &object.chunks {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Canceled);
        }
        match repo.get_blob(ResourceKind::Chunk, &chunk.mac) {
            Ok(data) => {
                if data.len() as u32 != chunk.length {
                    report.issue(format!(
                        "{}: chunk {} is {} bytes, expected {}",
                        pathname,
                        chunk.mac,
                        data.len(),
                        chunk.length
                    ));
                }
                report.chunks += 1;
                report.bytes += u64::from(chunk.length);
            }
            Err(e) => {
                report.issue(format!("{}: chunk {}: {}", pathname, chunk.mac, e));
            }
        }
    }
    Ok(())
}

fn check_xattr(
    repo: &Repository,
    pathname: &str,
    xattr: &Xattr,
    cancel: &CancelToken,
    report: &mut CheckReport,
) -> Result<()> {
    match repo.get_blob(ResourceKind::Object, &xattr.object) {
        Ok(bytes) => match Object::from_bytes(&bytes) {
            Ok(object) => check_object(repo, pathname, &object, cancel, report)?,
            Err(e) => report.issue(format!(
                "{}: xattr {} object undecodable: {}",
                pathname, xattr.name, e
            )),
        },
        Err(e) => report.issue(format!(
            "{}: xattr {} object: {}",
            pathname, xattr.name, e
        )),
    }
    Ok(())
}

/// Verifies every snapshot in the repository.
pub fn check_repository(
    repo: &Repository,
    cancel: &CancelToken,
) -> Result<Vec<(Mac, CheckReport)>> {
    let mut out = Vec::new();
    for (mac, _header) in snapshot::list_headers(repo)? {
        out.push((mac, check_snapshot(repo, &mac, cancel)?));
    }
    Ok(out)
}
