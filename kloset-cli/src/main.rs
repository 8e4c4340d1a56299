mod backup;
mod check;
mod cli;
mod create;
mod ls;
mod restore;
mod sync;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = cli::Opt::parse();
    let passphrase = opt.passphrase.clone();
    let (store, command) = match opt.root {
        cli::Root::At { store, command } => (store, command),
    };

    let result = match command {
        cli::Command::Create { no_passphrase } => {
            create::run(&store, passphrase.as_deref(), no_passphrase)
        }
        cli::Command::Backup {
            path,
            tags,
            concurrency,
            job,
            no_passphrase,
        } => backup::run(
            &store,
            passphrase.as_deref(),
            &path,
            tags,
            concurrency,
            job,
            no_passphrase,
        ),
        cli::Command::Restore {
            snapshot,
            target,
            prefix,
        } => restore::run(&store, passphrase.as_deref(), &snapshot, &target, prefix),
        cli::Command::Check { snapshot } => {
            check::run(&store, passphrase.as_deref(), snapshot.as_deref())
        }
        cli::Command::Ls { snapshot, path } => ls::run(
            &store,
            passphrase.as_deref(),
            snapshot.as_deref(),
            path.as_deref(),
        ),
        cli::Command::Sync { destination } => {
            sync::run(&store, &destination, passphrase.as_deref())
        }
    };

    if let Err(error) = result {
        eprintln!("plakar: {:#}", error);
        std::process::exit(1);
    }
}
