use crate::cli;

use anyhow::{bail, Context, Result};
use kloset::snapshot::check::{check_repository, check_snapshot};
use kloset::snapshot::{self};
use kloset::CancelToken;

pub fn run(uri: &str, passphrase: Option<&str>, snapshot: Option<&str>) -> Result<()> {
    let repository = cli::open_repository(uri, passphrase)?;
    let cancel = CancelToken::new();

    let reports = match snapshot {
        Some(prefix) => {
            let mac = snapshot::resolve(&repository, prefix)
                .with_context(|| format!("no unique snapshot matches '{}'", prefix))?;
            vec![(mac, check_snapshot(&repository, &mac, &cancel)?)]
        }
        None => check_repository(&repository, &cancel)?,
    };

    let mut failed = 0;
    for (mac, report) in &reports {
        if report.ok() {
            println!(
                "{}: ok ({} entries, {} chunks, {} bytes)",
                cli::short(mac),
                report.entries,
                report.chunks,
                report.bytes
            );
        } else {
            failed += 1;
            println!("{}: {} issues", cli::short(mac), report.issues.len());
            for issue in &report.issues {
                println!("  {}", issue);
            }
        }
    }
    repository.close()?;
    if failed > 0 {
        bail!("{} snapshot(s) failed verification", failed);
    }
    Ok(())
}
