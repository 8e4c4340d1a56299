use crate::cli;

use anyhow::{bail, Context, Result};
use kloset::store::open_store;
use kloset::Repository;

pub fn run(uri: &str, passphrase: Option<&str>, no_passphrase: bool) -> Result<()> {
    if uri.starts_with("ptar://") {
        bail!("a ptar archive is created and populated in one run: use 'backup'");
    }
    let (key, config) = cli::new_repository_config(passphrase, no_passphrase)?;
    let store = open_store(uri).with_context(|| format!("cannot resolve store {}", uri))?;
    let repository = Repository::create(store, config, key)
        .with_context(|| format!("cannot create repository at {}", uri))?;
    let location = repository.location();
    repository.close()?;
    println!("created repository at {}", location);
    Ok(())
}
