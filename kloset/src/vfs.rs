/*!
The read-only filesystem view over a snapshot.

A snapshot indexes its contents in three persisted B+trees:

- the path tree, `pathname → entry MAC`, ordered by [`PathOrdering`]
  (depth first, then lexicographic), which makes enumerating a directory a
  contiguous range scan;
- the xattr tree, `pathname ‖ NUL ‖ name → xattr MAC`, plain string order;
- the errors tree, `pathname → message`, plain string order, with the
  messages stored inline in the leaves.

The trees live in the repository as content-addressed nodes; reads go
through [`RepositoryNodeStore`], which resolves node pointers (MACs)
through the blob layer and can never update a node in place.
*/

pub mod entry;

pub use self::entry::{ChunkRef, Entry, EntryKind, FileInfo, Object, Xattr};

use crate::repository::{Repository, RepositoryError};

use kloset_btree::{BTree, Descriptor, Error as TreeError, KeyOrdering, NaturalOrdering, Node, NodeStore};
use kloset_core::mac::Mac;
use kloset_core::resource::ResourceKind;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use std::cmp::Ordering;
use std::marker::PhantomData;

/// Symlink resolutions tolerated before giving up on a path.
const MAX_SYMLINK_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("path not found")]
    NotFound,
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("too many levels of symbolic links")]
    Loop,
    #[error("repository error")]
    Repository(#[from] RepositoryError),
    #[error("index tree error")]
    Tree(#[from] TreeError),
    #[error("record decode error")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("record encode error")]
    Encode(#[from] rmp_serde::encode::Error),
    /// A decoded record violates its shape invariants: a diagnostic about
    /// bad data, reported in every build profile.
    #[error("malformed record: {0}")]
    Malformed(String),
    /// A broken internal assumption: a bug, raised through
    /// [`invariant_failure`] only.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Flags a broken internal assumption: a bug in the calling code, not bad
/// data. Panics in debug builds so the bug is caught where it happens;
/// release builds surface it as a fatal [`VfsError::Invariant`].
pub(crate) fn invariant_failure(message: String) -> VfsError {
    debug_assert!(false, "{}", message);
    VfsError::Invariant(message)
}

type Result<T> = std::result::Result<T, VfsError>;

/// Number of path components, with the root counting as zero.
pub fn path_depth(path: &str) -> usize {
    if path == "/" {
        0
    } else {
        path.matches('/').count()
    }
}

/// Normalizes a pathname into the canonical form the trees are keyed by:
/// absolute, forward slashes, no trailing slash, no empty or dot segments.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// The key of one `(path, attribute)` pair in the xattr tree. NUL cannot
/// appear in either component, so the mapping is unambiguous.
pub fn xattr_key(path: &str, name: &str) -> String {
    format!("{}\u{0}{}", path, name)
}

/// Orders paths by depth first, then lexicographically.
///
/// Under this ordering all children of a directory form one contiguous key
/// range, and every parent sorts before any of its descendants.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathOrdering;

impl KeyOrdering<String> for PathOrdering {
    fn cmp(&self, a: &String, b: &String) -> Ordering {
        path_depth(a)
            .cmp(&path_depth(b))
            .then_with(|| a.cmp(b))
    }
}

/// B+tree node storage backed by a repository's blob layer.
///
/// Pointers are MACs; `put` feeds the packer and `get` resolves committed
/// blobs. In-place update is impossible by construction, which is exactly
/// what [`BTree::persist`] is for.
pub struct RepositoryNodeStore<'r, V> {
    repo: &'r Repository,
    kind: ResourceKind,
    _values: PhantomData<V>,
}

impl<'r, V> RepositoryNodeStore<'r, V> {
    pub fn new(repo: &'r Repository, kind: ResourceKind) -> RepositoryNodeStore<'r, V> {
        RepositoryNodeStore {
            repo,
            kind,
            _values: PhantomData,
        }
    }
}

impl<'r, V> NodeStore<String, V> for RepositoryNodeStore<'r, V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    type Pointer = Mac;

    fn get(&mut self, ptr: &Mac) -> kloset_btree::Result<Node<String, V, Mac>> {
        let bytes = self
            .repo
            .get_blob(self.kind, ptr)
            .map_err(|e| TreeError::Store(e.to_string()))?;
        rmp_serde::from_slice(&bytes)
            .map_err(|e| TreeError::Corrupted(format!("node {} does not decode: {}", ptr, e)))
    }

    fn update(&mut self, _ptr: &Mac, _node: Node<String, V, Mac>) -> kloset_btree::Result<()> {
        Err(TreeError::Store(
            "content-addressed node storage cannot update nodes".to_string(),
        ))
    }

    fn put(&mut self, node: Node<String, V, Mac>) -> kloset_btree::Result<Mac> {
        let bytes = rmp_serde::to_vec(&node)
            .map_err(|e| TreeError::Store(format!("node encode failed: {}", e)))?;
        self.repo
            .put_blob(self.kind, bytes)
            .map_err(|e| TreeError::Store(e.to_string()))
    }
}

pub type PathTree<'r> = BTree<String, Mac, RepositoryNodeStore<'r, Mac>, PathOrdering>;
pub type XattrTree<'r> = BTree<String, Mac, RepositoryNodeStore<'r, Mac>, NaturalOrdering>;
pub type ErrorTree<'r> = BTree<String, String, RepositoryNodeStore<'r, String>, NaturalOrdering>;

/// Reads a persisted tree descriptor blob.
pub fn load_descriptor(
    repo: &Repository,
    kind: ResourceKind,
    mac: &Mac,
) -> Result<Descriptor<Mac>> {
    let bytes = repo.get_blob(kind, mac)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

/// The filesystem view over one snapshot.
pub struct Vfs<'r> {
    repo: &'r Repository,
    tree: PathTree<'r>,
    xattrs: XattrTree<'r>,
    errors: ErrorTree<'r>,
}

impl<'r> Vfs<'r> {
    /// Opens the view from the three tree descriptor MACs a snapshot
    /// header carries.
    pub fn open(
        repo: &'r Repository,
        vfs_root: &Mac,
        xattr_root: &Mac,
        errors_root: &Mac,
    ) -> Result<Vfs<'r>> {
        let tree = BTree::from_storage_with_ordering(
            RepositoryNodeStore::new(repo, ResourceKind::VfsNode),
            load_descriptor(repo, ResourceKind::VfsBtreeRoot, vfs_root)?,
            PathOrdering,
        );
        let xattrs = BTree::from_storage_with_ordering(
            RepositoryNodeStore::new(repo, ResourceKind::XattrNode),
            load_descriptor(repo, ResourceKind::XattrBtreeRoot, xattr_root)?,
            NaturalOrdering,
        );
        let errors = BTree::from_storage_with_ordering(
            RepositoryNodeStore::new(repo, ResourceKind::ErrorNode),
            load_descriptor(repo, ResourceKind::ErrorBtreeRoot, errors_root)?,
            NaturalOrdering,
        );
        Ok(Vfs {
            repo,
            tree,
            xattrs,
            errors,
        })
    }

    /// Number of pathnames indexed by the snapshot.
    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }

    fn load_entry(repo: &Repository, mac: &Mac) -> Result<Entry> {
        let bytes = repo.get_blob(ResourceKind::VfsEntry, mac)?;
        let entry = Entry::from_bytes(&bytes)?;
        entry.validate()?;
        Ok(entry)
    }

    /// Loads an entry blob directly by its MAC, as yielded by
    /// [`Vfs::walk`].
    pub fn entry_at(&self, mac: &Mac) -> Result<Entry> {
        Self::load_entry(self.repo, mac)
    }

    /// Resolves a path to its entry without following a final symlink.
    pub fn entry(&mut self, path: &str) -> Result<Entry> {
        let path = normalize_path(path);
        let mac = self.tree.find(&path)?.ok_or(VfsError::NotFound)?;
        Self::load_entry(self.repo, &mac)
    }

    /// Resolves a path to its entry, following symlinks relative to their
    /// containing directory.
    ///
    /// # Errors
    ///
    /// Returns `VfsError::Loop` after [`MAX_SYMLINK_DEPTH`] resolutions.
    pub fn lookup(&mut self, path: &str) -> Result<Entry> {
        let mut current = normalize_path(path);
        for _ in 0..MAX_SYMLINK_DEPTH {
            let entry = self.entry(&current)?;
            if entry.kind != EntryKind::Symlink {
                return Ok(entry);
            }
            let target = entry
                .symlink_target
                .as_deref()
                .expect("validate() guarantees symlinks carry a target");
            current = if target.starts_with('/') {
                normalize_path(target)
            } else {
                let parent = match current.rfind('/') {
                    Some(0) | None => "/".to_string(),
                    Some(idx) => current[..idx].to_string(),
                };
                normalize_path(&format!("{}/{}", parent, target))
            };
        }
        Err(VfsError::Loop)
    }

    /// Enumerates the immediate children of a directory, in name order.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<Entry>> {
        let path = normalize_path(path);
        let entry = self.entry(&path)?;
        if entry.kind != EntryKind::Directory {
            return Err(VfsError::NotADirectory(path));
        }
        let start = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let target_depth = path_depth(&path) + 1;
        let mut children: Vec<Mac> = Vec::new();
        for item in self.tree.scan_from(&start)? {
            let (key, mac) = item?;
            let depth = path_depth(&key);
            if depth < target_depth {
                continue;
            }
            if depth > target_depth || !key.starts_with(&start) {
                break;
            }
            children.push(mac);
        }
        let mut out = Vec::with_capacity(children.len());
        for mac in children {
            out.push(Self::load_entry(self.repo, &mac)?);
        }
        Ok(out)
    }

    /// Every `(pathname, entry MAC)` pair, in tree order (parents before
    /// descendants), optionally restricted to a path prefix.
    pub fn walk(&mut self, prefix: Option<&str>) -> Result<Vec<(String, Mac)>> {
        let prefix = prefix.map(normalize_path);
        let mut out = Vec::new();
        for item in self.tree.scan()? {
            let (key, mac) = item?;
            if let Some(prefix) = &prefix {
                let keep = prefix == "/"
                    || key == *prefix
                    || key.starts_with(&format!("{}/", prefix));
                if !keep {
                    continue;
                }
            }
            out.push((key, mac));
        }
        Ok(out)
    }

    /// Pathnames under a prefix, in tree order.
    pub fn files(&mut self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .walk(Some(prefix))?
            .into_iter()
            .map(|(path, _)| path)
            .collect())
    }

    /// Loads the object behind a regular entry.
    ///
    /// Asking for the object of a directory or symlink is a bug in the
    /// caller, not a property of the snapshot.
    pub fn object(&self, entry: &Entry) -> Result<Object> {
        let mac = entry.object.as_ref().ok_or_else(|| {
            invariant_failure(format!("{} has no file body", entry.pathname))
        })?;
        let bytes = self.repo.get_blob(ResourceKind::Object, mac)?;
        Object::from_bytes(&bytes)
    }

    /// Looks up one extended attribute of a path.
    pub fn xattr(&mut self, path: &str, name: &str) -> Result<Xattr> {
        let key = xattr_key(&normalize_path(path), name);
        let mac = self.xattrs.find(&key)?.ok_or(VfsError::NotFound)?;
        let bytes = self.repo.get_blob(ResourceKind::XattrEntry, &mac)?;
        Xattr::from_bytes(&bytes)
    }

    /// Every per-path error recorded by the backup that produced this
    /// snapshot.
    pub fn errors(&mut self) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for item in self.errors.scan()? {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn tree(&mut self) -> &mut PathTree<'r> {
        &mut self.tree
    }

    pub fn xattr_tree(&mut self) -> &mut XattrTree<'r> {
        &mut self.xattrs
    }

    pub fn error_tree(&mut self) -> &mut ErrorTree<'r> {
        &mut self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_ordering_is_depth_major() {
        let ordering = PathOrdering;
        let mut paths = vec![
            "/b/c".to_string(),
            "/".to_string(),
            "/b".to_string(),
            "/a/z/x".to_string(),
            "/a".to_string(),
            "/a/b".to_string(),
        ];
        paths.sort_by(|a, b| ordering.cmp(a, b));
        assert_eq!(paths, vec!["/", "/a", "/b", "/a/b", "/b/c", "/a/z/x"]);
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path("/a/./b"), "/a/b");
        assert_eq!(normalize_path("/a/../b"), "/b");
        assert_eq!(normalize_path("/../../x"), "/x");
    }

    #[test]
    fn depth() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/a"), 1);
        assert_eq!(path_depth("/a/b"), 2);
    }
}
