use crate::cli;

use anyhow::{Context, Result};
use kloset::events::EventBus;
use kloset::exporter::filesystem::FilesystemExporter;
use kloset::snapshot::restore::{restore, RestoreOptions};
use kloset::snapshot::{self};
use kloset::CancelToken;

use std::path::Path;

pub fn run(
    uri: &str,
    passphrase: Option<&str>,
    snapshot: &str,
    target: &Path,
    prefix: Option<String>,
) -> Result<()> {
    let repository = cli::open_repository(uri, passphrase)?;
    let mac = snapshot::resolve(&repository, snapshot)
        .with_context(|| format!("no unique snapshot matches '{}'", snapshot))?;

    let events = EventBus::new();
    let cancel = CancelToken::new();
    let mut exporter = FilesystemExporter::new(target);
    let (entries, bytes) = restore(
        &repository,
        &mac,
        &RestoreOptions { prefix },
        &mut exporter,
        &events,
        &cancel,
    )
    .with_context(|| format!("restore of {} failed", cli::short(&mac)))?;

    println!(
        "restored {} entries ({} bytes) from {} into {}",
        entries,
        bytes,
        cli::short(&mac),
        target.display()
    );
    repository.close()?;
    Ok(())
}
