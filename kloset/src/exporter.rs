//! The exporter contract: where a restore writes its output.

pub mod filesystem;

use crate::vfs::FileInfo;

use std::io::Read;

/// A restore destination.
///
/// The restore walk guarantees directories are created before anything
/// inside them; permissions are applied after content.
pub trait Exporter: Send {
    /// The destination root this exporter writes under.
    fn root(&self) -> String;

    fn create_directory(&mut self, pathname: &str) -> std::io::Result<()>;

    fn store_file(
        &mut self,
        pathname: &str,
        content: &mut dyn Read,
        info: &FileInfo,
    ) -> std::io::Result<()>;

    fn create_symlink(&mut self, pathname: &str, target: &str) -> std::io::Result<()>;

    fn set_permissions(&mut self, pathname: &str, info: &FileInfo) -> std::io::Result<()>;

    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
