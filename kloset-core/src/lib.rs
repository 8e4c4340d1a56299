/*!
This crate contains the data structures and on-disk formats shared by every
layer of the kloset backup engine.

When a data structure in this crate carries a Serialize/Deserialize derive,
the format `rmp-serde` produces from serializing it is considered to be the
canonical on-disk representation of that object. The exceptions are the raw
framing formats (packfile footers, the ptar trailer), which are specified
byte-for-byte in their own modules.
*/

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod key;
pub mod mac;
pub mod packfile;
pub mod ptar;
pub mod resource;
pub mod state;

pub use self::cancel::CancelToken;
pub use self::compression::Compression;
pub use self::encryption::Encryption;
pub use self::key::{Key, WrappedKey};
pub use self::mac::{Mac, MacAlgorithm};
pub use self::resource::ResourceKind;

/// The version of the engine, as reported in repository configurations.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The on-disk format version written into new repositories.
pub const FORMAT_VERSION: u32 = 1;
