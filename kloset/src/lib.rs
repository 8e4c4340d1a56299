/*!
kloset provides a consistent high-level interface to deduplicating,
client-side-encrypted backup repositories across multiple storage backends
and data sources.

A repository is a content-addressed blob store: every persisted entity is
identified by a keyed MAC of its plaintext, every byte at rest is
compressed and encrypted, and bulk data travels in append-only packfiles.
Snapshots index file trees in persistent B+trees and are restorable,
verifiable, listable, and synchronizable across repositories.

The crate is layered bottom-up:

- [`store`] — opaque named-blob backends (filesystem, in-memory, single-file
  ptar archives) behind one object-safe trait and a URI scheme registry;
- [`repository`] — the packer pool, the live state index, and the
  MAC-to-bytes resolution every higher layer relies on;
- [`vfs`] — the read-only filesystem view over a snapshot's path trees;
- [`snapshot`] — the concurrent backup builder plus restore, check, and
  repository-to-repository synchronization;
- [`importer`] / [`exporter`] — the scan and restore contracts with their
  filesystem implementations.
*/

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod events;
pub mod exporter;
pub mod importer;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod vfs;

pub use crate::repository::{Repository, RepositoryError};
pub use crate::store::{open_store, Store, StoreError};

pub use kloset_core::cancel::CancelToken;
pub use kloset_core::compression::Compression;
pub use kloset_core::config::Config;
pub use kloset_core::encryption::Encryption;
pub use kloset_core::key::Key;
pub use kloset_core::mac::{Mac, MacAlgorithm};
pub use kloset_core::resource::ResourceKind;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
