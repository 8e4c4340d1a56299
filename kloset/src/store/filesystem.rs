/*!
The filesystem store.

On-disk layout under the root directory:

```text
CONFIG
packfiles/<hex-first-byte>/<64-hex-mac>
states/<hex-first-byte>/<64-hex-mac>
locks/<64-hex-mac>
```

Every write lands in a tempfile in the destination directory and is
renamed into place, so a blob is either fully visible under its final name
or not at all.
*/

use super::{map_not_found, Mode, Result, Store, StoreError};

use kloset_core::mac::Mac;

use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "CONFIG";

/// Creates a filesystem store handle for the given root path. Nothing is
/// touched on disk until `create` or `open`.
pub fn factory(location: &str) -> Result<Box<dyn Store>> {
    Ok(Box::new(FilesystemStore::new(location)))
}

#[derive(Debug)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl AsRef<Path>) -> FilesystemStore {
        FilesystemStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn shard_path(&self, class: &str, mac: &Mac) -> PathBuf {
        let hex = mac.to_hex();
        self.root.join(class).join(&hex[..2]).join(hex)
    }

    fn lock_path(&self, mac: &Mac) -> PathBuf {
        self.root.join("locks").join(mac.to_hex())
    }

    // Tempfile-in-same-directory followed by an atomic rename.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<u64> {
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Transport("blob path has no parent".to_string()))?;
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(".tmp.{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp)?;
        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        drop(file);
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(data.len() as u64)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(map_not_found)
    }

    // Walks a two-level sharded directory collecting MAC-named files.
    fn list_sharded(&self, class: &str) -> Result<Vec<Mac>> {
        let dir = self.root.join(class);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut macs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for blob in fs::read_dir(entry.path())? {
                let blob = blob?;
                if let Some(name) = blob.file_name().to_str() {
                    if let Ok(mac) = Mac::from_hex(name) {
                        macs.push(mac);
                    }
                }
            }
        }
        Ok(macs)
    }
}

impl Store for FilesystemStore {
    fn location(&self) -> String {
        format!("fs://{}", self.root.display())
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        if self.root.join(CONFIG_FILE).exists() {
            return Err(StoreError::NotWritable(format!(
                "a repository already exists at {}",
                self.root.display()
            )));
        }
        fs::create_dir_all(&self.root)?;
        for class in ["packfiles", "states", "locks"].iter() {
            fs::create_dir_all(self.root.join(class))?;
        }
        debug!(root = %self.root.display(), "created filesystem store");
        self.atomic_write(&self.root.join(CONFIG_FILE), config)?;
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.read_file(&self.root.join(CONFIG_FILE))
    }

    fn size(&self) -> Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    fn list_packfiles(&self) -> Result<Vec<Mac>> {
        self.list_sharded("packfiles")
    }

    fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        self.atomic_write(&self.shard_path("packfiles", &mac), data)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>> {
        self.read_file(&self.shard_path("packfiles", &mac))
    }

    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut file =
            fs::File::open(self.shard_path("packfiles", &mac)).map_err(map_not_found)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0_u8; length as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        fs::remove_file(self.shard_path("packfiles", &mac)).map_err(map_not_found)
    }

    fn list_states(&self) -> Result<Vec<Mac>> {
        self.list_sharded("states")
    }

    fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        self.atomic_write(&self.shard_path("states", &mac), data)
    }

    fn get_state(&self, mac: Mac) -> Result<Vec<u8>> {
        self.read_file(&self.shard_path("states", &mac))
    }

    fn delete_state(&self, mac: Mac) -> Result<()> {
        fs::remove_file(self.shard_path("states", &mac)).map_err(map_not_found)
    }

    fn list_locks(&self) -> Result<Vec<Mac>> {
        let dir = self.root.join("locks");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut macs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(mac) = Mac::from_hex(name) {
                    macs.push(mac);
                }
            }
        }
        Ok(macs)
    }

    fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64> {
        self.atomic_write(&self.lock_path(&mac), data)
    }

    fn get_lock(&self, mac: Mac) -> Result<Vec<u8>> {
        self.read_file(&self.lock_path(&mac))
    }

    fn delete_lock(&self, mac: Mac) -> Result<()> {
        fs::remove_file(self.lock_path(&mac)).map_err(map_not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_round_trip() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("repo"));
        store.create(b"configuration bytes").unwrap();
        assert_eq!(store.open().unwrap(), b"configuration bytes");
        // creating twice must fail
        assert!(store.create(b"again").is_err());
    }

    #[test]
    fn packfile_layout_and_ranged_reads() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("repo"));
        store.create(b"c").unwrap();
        let mac = Mac::new(&[0xab; 32]);
        store.put_packfile(mac, b"0123456789").unwrap();

        let hex = mac.to_hex();
        let expected = dir
            .path()
            .join("repo")
            .join("packfiles")
            .join(&hex[..2])
            .join(&hex);
        assert!(expected.is_file());

        assert_eq!(store.get_packfile(mac).unwrap(), b"0123456789");
        assert_eq!(store.get_packfile_blob(mac, 3, 4).unwrap(), b"3456");
        assert_eq!(store.list_packfiles().unwrap(), vec![mac]);

        store.delete_packfile(mac).unwrap();
        assert!(matches!(
            store.get_packfile(mac),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn locks_are_flat() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().join("repo"));
        store.create(b"c").unwrap();
        let mac = Mac::random();
        store.put_lock(mac, b"lock body").unwrap();
        assert_eq!(store.list_locks().unwrap(), vec![mac]);
        assert_eq!(store.get_lock(mac).unwrap(), b"lock body");
        store.delete_lock(mac).unwrap();
        assert!(store.list_locks().unwrap().is_empty());
    }
}
