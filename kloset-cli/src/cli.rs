/*!
Command line argument types, plus the helpers that turn them into open
repositories.
*/

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kloset::store::open_store;
use kloset::Repository;
use kloset::RepositoryError;
use kloset::{Compression, Config, Encryption, Key, MacAlgorithm};
use kloset_core::config::KeySlot;
use kloset_core::key::{KdfParams, WrappedKey};

use std::path::PathBuf;

/// Deduplicating, client-side-encrypted backup tool.
#[derive(Parser, Debug)]
#[command(name = "plakar", version, about)]
pub struct Opt {
    /// Repository passphrase. Prompted for interactively when required and
    /// absent.
    #[arg(long, env = "PLAKAR_PASSPHRASE", hide_env_values = true, global = true)]
    pub passphrase: Option<String>,

    #[command(subcommand)]
    pub root: Root,
}

#[derive(Subcommand, Debug)]
pub enum Root {
    /// Operate on the repository at the given store URI
    At {
        /// Store URI: fs://<dir>, ptar://<file>, mem://<name>, or a bare
        /// directory path
        store: String,

        #[command(subcommand)]
        command: Command,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new repository
    Create {
        /// Store the key in the clear instead of wrapping it under a
        /// passphrase
        #[arg(long)]
        no_passphrase: bool,
    },
    /// Create a snapshot of a directory
    Backup {
        /// Directory to back up
        path: PathBuf,
        /// Attach a tag to the snapshot (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Worker threads; defaults to one per CPU
        #[arg(long)]
        concurrency: Option<usize>,
        /// Free-form job label recorded in the snapshot
        #[arg(long)]
        job: Option<String>,
        /// When creating a fresh ptar archive, store its key in the clear
        #[arg(long)]
        no_passphrase: bool,
    },
    /// Restore a snapshot into a directory
    Restore {
        /// Snapshot MAC or identifier (hex prefix accepted)
        snapshot: String,
        /// Directory to restore into
        target: PathBuf,
        /// Restore only this subtree
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Verify snapshot integrity
    Check {
        /// Snapshot to verify; every snapshot when omitted
        snapshot: Option<String>,
    },
    /// List snapshots, or the contents of one
    Ls {
        /// Snapshot to list
        snapshot: Option<String>,
        /// Directory within the snapshot
        path: Option<String>,
    },
    /// Copy snapshots into another repository
    Sync {
        /// Destination store URI
        destination: String,
    },
}

/// Opens the repository at `uri`, prompting for a passphrase when the
/// repository requires one and none was supplied.
pub fn open_repository(uri: &str, passphrase: Option<&str>) -> Result<Repository> {
    let store = open_store(uri).with_context(|| format!("cannot resolve store {}", uri))?;
    match Repository::open(store, passphrase.map(str::as_bytes)) {
        Ok(repository) => Ok(repository),
        Err(RepositoryError::Key(_)) if passphrase.is_none() => {
            let prompted = rpassword::prompt_password("repository passphrase: ")
                .context("cannot read passphrase")?;
            let store = open_store(uri)?;
            Repository::open(store, Some(prompted.as_bytes()))
                .context("unable to open repository, possibly due to an invalid passphrase")
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("cannot open repository at {}", uri)))
        }
    }
}

/// Builds the key material and configuration of a fresh repository,
/// prompting for a passphrase when necessary.
pub fn new_repository_config(
    passphrase: Option<&str>,
    no_passphrase: bool,
) -> Result<(Key, Config)> {
    let key = Key::random();
    let slot = if no_passphrase {
        KeySlot::Plain(key.clone())
    } else {
        let passphrase = match passphrase {
            Some(passphrase) => passphrase.to_string(),
            None => {
                let first = rpassword::prompt_password("new repository passphrase: ")
                    .context("cannot read passphrase")?;
                let second = rpassword::prompt_password("repeat passphrase: ")
                    .context("cannot read passphrase")?;
                if first != second {
                    bail!("passphrases do not match");
                }
                first
            }
        };
        if passphrase.is_empty() {
            bail!("empty passphrase; use --no-passphrase for an unprotected repository");
        }
        KeySlot::Wrapped(
            WrappedKey::wrap(&key, passphrase.as_bytes(), KdfParams::defaults())
                .context("cannot wrap repository key")?,
        )
    };
    let config = Config::new(
        MacAlgorithm::Blake3Keyed,
        Encryption::Aes256GcmSiv,
        Compression::default(),
        slot,
    );
    Ok((key, config))
}

/// Short form of a MAC for display.
pub fn short(mac: &kloset::Mac) -> String {
    mac.to_hex()[..12].to_string()
}
