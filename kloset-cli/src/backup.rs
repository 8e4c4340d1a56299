use crate::cli;

use anyhow::{Context, Result};
use kloset::events::Event;
use kloset::events::EventBus;
use kloset::importer::filesystem::FilesystemImporter;
use kloset::snapshot::builder::{backup, BackupOptions};
use kloset::store::open_store;
use kloset::{CancelToken, Repository};

use std::path::Path;
use std::thread;

pub fn run(
    uri: &str,
    passphrase: Option<&str>,
    path: &Path,
    tags: Vec<String>,
    concurrency: Option<usize>,
    job: Option<String>,
    no_passphrase: bool,
) -> Result<()> {
    // a ptar archive is created and populated in a single run
    let repository = if uri.starts_with("ptar://") && !Path::new(&uri[7..]).exists() {
        let (key, config) = cli::new_repository_config(passphrase, no_passphrase)?;
        let store = open_store(uri).with_context(|| format!("cannot resolve store {}", uri))?;
        Repository::create(store, config, key)
            .with_context(|| format!("cannot create archive at {}", uri))?
    } else {
        cli::open_repository(uri, passphrase)?
    };

    let events = EventBus::new();
    let progress = events.subscribe();
    thread::spawn(move || {
        for event in progress {
            if let Event::PathError { pathname, message } = event {
                eprintln!("warning: {}: {}", pathname, message);
            }
        }
    });

    let cancel = CancelToken::new();
    let mut importer = FilesystemImporter::new(path);
    let options = BackupOptions {
        max_concurrency: concurrency.unwrap_or(0),
        tags,
        job,
    };
    let (mac, header) = backup(&repository, &mut importer, &options, &events, &cancel)
        .with_context(|| format!("backup of {} failed", path.display()))?;

    println!(
        "created snapshot {} ({} files, {} directories, {} bytes{})",
        cli::short(&mac),
        header.summary.files,
        header.summary.directories,
        header.summary.total_size,
        if header.summary.errors > 0 {
            format!(", {} errors", header.summary.errors)
        } else {
            String::new()
        }
    );
    repository.close()?;
    Ok(())
}
