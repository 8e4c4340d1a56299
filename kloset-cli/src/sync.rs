use crate::cli;

use anyhow::{Context, Result};
use kloset::snapshot::sync::sync_all;
use kloset::CancelToken;

pub fn run(uri: &str, destination: &str, passphrase: Option<&str>) -> Result<()> {
    let source = cli::open_repository(uri, passphrase)?;
    // the same passphrase option applies to both ends; replicas share key
    // material by construction
    let dest = cli::open_repository(destination, passphrase)
        .with_context(|| format!("cannot open destination {}", destination))?;

    let cancel = CancelToken::new();
    let copied = sync_all(&source, &dest, &cancel)
        .with_context(|| format!("synchronization into {} failed", destination))?;

    println!("synchronized {} blobs into {}", copied, destination);
    dest.close()?;
    source.close()?;
    Ok(())
}
