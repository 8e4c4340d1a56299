//! The filesystem exporter.

use super::Exporter;
use crate::vfs::FileInfo;

use tracing::trace;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub struct FilesystemExporter {
    root: PathBuf,
}

impl FilesystemExporter {
    pub fn new(root: impl AsRef<Path>) -> FilesystemExporter {
        FilesystemExporter {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn target(&self, pathname: &str) -> PathBuf {
        self.root.join(pathname.trim_start_matches('/'))
    }
}

impl Exporter for FilesystemExporter {
    fn root(&self) -> String {
        self.root.display().to_string()
    }

    fn create_directory(&mut self, pathname: &str) -> std::io::Result<()> {
        trace!(pathname, "restoring directory");
        fs::create_dir_all(self.target(pathname))
    }

    fn store_file(
        &mut self,
        pathname: &str,
        content: &mut dyn Read,
        _info: &FileInfo,
    ) -> std::io::Result<()> {
        trace!(pathname, "restoring file");
        let target = self.target(pathname);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&target)?;
        std::io::copy(content, &mut file)?;
        file.sync_all()
    }

    fn create_symlink(&mut self, pathname: &str, target: &str) -> std::io::Result<()> {
        let link = self.target(pathname);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &link)
        }
        #[cfg(not(unix))]
        {
            // symlinks need privileges on other platforms; materialize the
            // target path as a plain file holding the link text
            fs::write(&link, target)
        }
    }

    fn set_permissions(&mut self, pathname: &str, info: &FileInfo) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let target = self.target(pathname);
            // symlink permissions are not restorable portably; skip them
            let metadata = fs::symlink_metadata(&target)?;
            if metadata.file_type().is_symlink() {
                return Ok(());
            }
            fs::set_permissions(&target, fs::Permissions::from_mode(info.mode & 0o7777))
        }
        #[cfg(not(unix))]
        {
            let _ = (pathname, info);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_under_the_root() {
        let dir = tempdir().unwrap();
        let mut exporter = FilesystemExporter::new(dir.path());
        exporter.create_directory("/sub").unwrap();
        let mut body: &[u8] = b"restored bytes";
        exporter
            .store_file("/sub/file.txt", &mut body, &FileInfo::synthetic(14, 0o644))
            .unwrap();
        assert_eq!(
            fs::read(dir.path().join("sub/file.txt")).unwrap(),
            b"restored bytes"
        );
    }
}
