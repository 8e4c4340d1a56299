use crate::cli;

use anyhow::{Context, Result};
use kloset::snapshot::{self};
use kloset::vfs::EntryKind;

pub fn run(
    uri: &str,
    passphrase: Option<&str>,
    snapshot: Option<&str>,
    path: Option<&str>,
) -> Result<()> {
    let repository = cli::open_repository(uri, passphrase)?;
    match snapshot {
        None => {
            for (mac, header) in snapshot::list_headers(&repository)? {
                println!(
                    "{}  {}  {:>8} files  {:>12} bytes  {}",
                    cli::short(&mac),
                    header.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    header.summary.files,
                    header.summary.total_size,
                    header.importer_origin,
                );
            }
        }
        Some(prefix) => {
            let mac = snapshot::resolve(&repository, prefix)
                .with_context(|| format!("no unique snapshot matches '{}'", prefix))?;
            let header = snapshot::get_header(&repository, &mac)?;
            let mut vfs = snapshot::open_vfs(&repository, &header)?;
            for entry in vfs.read_dir(path.unwrap_or("/"))? {
                let marker = match entry.kind {
                    EntryKind::Directory => "/",
                    EntryKind::Symlink => "@",
                    EntryKind::Regular => "",
                };
                println!(
                    "{:o}  {:>12}  {}{}",
                    entry.info.mode & 0o7777,
                    entry.info.size,
                    entry.pathname,
                    marker,
                );
            }
        }
    }
    repository.close()?;
    Ok(())
}
