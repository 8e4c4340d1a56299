/*!
A generic ordered map backed by a B+tree over pluggable node storage.

The tree buffers insertions in its internal nodes the way fractal trees do:
an insert descends only far enough to find an internal node with buffer
room, which keeps the number of node rewrites per operation low. When a
buffer spills, the subset of operations bound for the busiest child moves
down one level in a single batch. Searches consult the buffers along the
descent path, so a buffered insertion is visible immediately.

Duplicate keys follow a first-writer-wins policy: inserting a key that is
already present returns [`Error::Exists`] and leaves the tree untouched.

Node storage is abstracted behind [`NodeStore`], which only requires
`get`/`update`/`put`. A bounded write-back LRU cache sits between the tree
and its store, so repeated descents over a hot path do not touch the store
at all, and node rewrites are coalesced until [`BTree::flush`] or eviction.

Content-addressed backends that cannot update nodes in place are served by
[`BTree::persist`], which writes a frozen copy of the tree into a second
store post-order, rightmost leaf first, so every leaf's `next` pointer is
known by the time the leaf itself is written.
*/

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod iter;
pub mod mem;
pub mod node;
pub mod persist;
pub mod verify;

pub use crate::node::{Descriptor, Node, Op, NODE_VERSION};

use crate::cache::NodeCache;

use kloset_core::cancel::CancelToken;
use thiserror::Error;
use tracing::trace;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

/// Error for everything that can go wrong operating on a tree
#[derive(Error, Debug)]
pub enum Error {
    #[error("key already exists")]
    Exists,
    #[error("operation was cancelled")]
    Canceled,
    #[error("node storage error: {0}")]
    Store(String),
    #[error("corrupted node: {0}")]
    Corrupted(String),
    #[error("tree invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Flags a broken internal assumption: a bug in the caller or the
    /// engine, not bad data. Panics in debug builds so the bug is caught
    /// where it happens; release builds surface it as a fatal `Invariant`
    /// error.
    ///
    /// The structural findings [`BTree::verify`] reports are not routed
    /// through here: they describe a possibly-corrupt tree and are
    /// returned in every build profile.
    pub(crate) fn invariant(message: String) -> Error {
        debug_assert!(false, "{}", message);
        Error::Invariant(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Backing storage for tree nodes.
///
/// `update` rewrites an existing node in place; content-addressed stores
/// that cannot do so should return an error from `update` and only ever be
/// used as [`BTree::persist`] targets or for reading persisted trees.
pub trait NodeStore<K, V> {
    type Pointer: Clone + Eq + Hash + Debug;

    fn get(&mut self, ptr: &Self::Pointer) -> Result<Node<K, V, Self::Pointer>>;
    fn update(&mut self, ptr: &Self::Pointer, node: Node<K, V, Self::Pointer>) -> Result<()>;
    fn put(&mut self, node: Node<K, V, Self::Pointer>) -> Result<Self::Pointer>;
}

/// The comparator a tree orders its keys by.
///
/// Trees persisted with one ordering must be reopened with the same one;
/// the ordering is part of the tree's identity even though it cannot be
/// serialized.
pub trait KeyOrdering<K>: Clone {
    fn cmp(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NaturalOrdering;

impl<K: Ord> KeyOrdering<K> for NaturalOrdering {
    fn cmp(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// A B+tree of order `m` over a [`NodeStore`].
///
/// `order` bounds the fan-out: a leaf holds at most `m - 1` keys, an
/// internal node at most `m` children.
pub struct BTree<K, V, S, C = NaturalOrdering>
where
    S: NodeStore<K, V>,
    C: KeyOrdering<K>,
{
    pub(crate) order: usize,
    pub(crate) count: u64,
    pub(crate) root: S::Pointer,
    pub(crate) store: NodeCache<K, V, S>,
    pub(crate) ordering: C,
    cancel: Option<CancelToken>,
    /// True when some internal node may be holding buffered ops. Scans and
    /// persists drain the buffers first; this flag lets read-mostly trees
    /// skip that walk.
    ops_buffered: bool,
}

impl<K, V, S> BTree<K, V, S, NaturalOrdering>
where
    K: Clone + Ord,
    V: Clone,
    S: NodeStore<K, V>,
{
    /// Creates a new, empty tree with the natural key ordering.
    pub fn new(store: S, order: usize) -> Result<Self> {
        BTree::with_ordering(store, order, NaturalOrdering)
    }

    /// Reopens a tree from its descriptor, with the natural key ordering.
    pub fn from_storage(store: S, descriptor: Descriptor<S::Pointer>) -> Self {
        BTree::from_storage_with_ordering(store, descriptor, NaturalOrdering)
    }
}

impl<K, V, S, C> BTree<K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
    C: KeyOrdering<K>,
{
    /// Creates a new, empty tree. `order` must be at least 3.
    pub fn with_ordering(store: S, order: usize, ordering: C) -> Result<Self> {
        if order < 3 {
            return Err(Error::invariant(format!(
                "order {} is too small for a B+tree",
                order
            )));
        }
        let mut store = NodeCache::new(store, 2 * order);
        let root = store.put(Node::leaf())?;
        Ok(BTree {
            order,
            count: 0,
            root,
            store,
            ordering,
            cancel: None,
            ops_buffered: false,
        })
    }

    /// Reopens a tree from its descriptor.
    pub fn from_storage_with_ordering(
        store: S,
        descriptor: Descriptor<S::Pointer>,
        ordering: C,
    ) -> Self {
        BTree {
            order: descriptor.order,
            count: descriptor.count,
            root: descriptor.root,
            store: NodeCache::new(store, 2 * descriptor.order),
            ordering,
            cancel: None,
            ops_buffered: false,
        }
    }

    /// The descriptor that reopens this tree. Call [`BTree::flush`] before
    /// serializing it if the backing store is shared.
    pub fn descriptor(&self) -> Descriptor<S::Pointer> {
        Descriptor {
            version: NODE_VERSION,
            order: self.order,
            count: self.count,
            root: self.root.clone(),
        }
    }

    /// Attaches a cancellation token, polled on every descent step.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Writes every dirty cached node back to the store.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Looks up the value stored under `key`.
    ///
    /// Buffered operations along the descent path shadow the leaf, so an
    /// insert is visible to `find` immediately after it returns.
    pub fn find(&mut self, key: &K) -> Result<Option<V>> {
        self.check_cancel()?;
        let mut current = self.root.clone();
        loop {
            let node = self.store.get(&current)?;
            if node.is_leaf() {
                return Ok(match self.search_keys(&node.keys, key) {
                    Ok(idx) => Some(node.values[idx].clone()),
                    Err(_) => None,
                });
            }
            for op in &node.ops {
                if self.ordering.cmp(&op.key, key) == Ordering::Equal {
                    return Ok(Some(op.value.clone()));
                }
            }
            let idx = self.child_index(&node, key);
            current = node.pointers[idx].clone();
            self.check_cancel()?;
        }
    }

    /// Inserts `(key, value)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exists`] if the key is already present; the first
    /// writer wins and the tree is left unchanged.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        self.check_cancel()?;
        if self.find(&key)?.is_some() {
            return Err(Error::Exists);
        }
        trace!("inserting key into tree of {} entries", self.count);
        let root = self.store.get(&self.root)?;
        let batch = vec![Op { key, value }];
        if root.is_leaf() {
            let ptr = self.root.clone();
            self.leaf_apply(&[], ptr, batch)?;
        } else {
            self.ops_buffered = true;
            self.internal_insert(batch)?;
        }
        self.count += 1;
        Ok(())
    }

    /// Pushes every buffered operation down to its leaf. Scans, persists,
    /// and verifications run over a drained tree.
    pub(crate) fn flush_ops(&mut self) -> Result<()> {
        if !self.ops_buffered {
            return Ok(());
        }
        let mut pending = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(ptr) = stack.pop() {
            self.check_cancel()?;
            let mut node = self.store.get(&ptr)?;
            if node.is_leaf() {
                continue;
            }
            stack.extend(node.pointers.iter().cloned());
            if !node.ops.is_empty() {
                pending.append(&mut node.ops);
                self.store.update(&ptr, node)?;
            }
        }
        for op in pending {
            self.insert_direct(op)?;
        }
        self.ops_buffered = false;
        Ok(())
    }

    // The buffered descent of a single insert batch, starting at the root.
    fn internal_insert(&mut self, mut batch: Vec<Op<K, V>>) -> Result<()> {
        let mut path: Vec<S::Pointer> = Vec::new();
        let mut current = self.root.clone();
        loop {
            self.check_cancel()?;
            let mut node = self.store.get(&current)?;
            if node.is_leaf() {
                return self.leaf_apply(&path, current, batch);
            }
            node.ops.append(&mut batch);
            if node.ops.len() < self.order {
                self.store.update(&current, node)?;
                return Ok(());
            }
            // The buffer spilled: move the ops bound for the busiest child
            // (ties toward the lower index) down one level, capped at order.
            let indices: Vec<usize> = node
                .ops
                .iter()
                .map(|op| self.child_index(&node, &op.key))
                .collect();
            let mut counts = vec![0_usize; node.pointers.len()];
            for &idx in &indices {
                counts[idx] += 1;
            }
            let mut chosen = 0;
            for (idx, &count) in counts.iter().enumerate() {
                if count > counts[chosen] {
                    chosen = idx;
                }
            }
            let mut moved = Vec::new();
            let mut kept = Vec::new();
            for (op, idx) in node.ops.drain(..).zip(indices.into_iter()) {
                if idx == chosen && moved.len() < self.order {
                    moved.push(op);
                } else {
                    kept.push(op);
                }
            }
            node.ops = kept;
            let child = node.pointers[chosen].clone();
            self.store.update(&current, node)?;
            path.push(current);
            current = child;
            batch = moved;
        }
    }

    // Applies a batch of operations at a leaf, splitting as needed. After
    // the first split the remaining operations re-descend from the root so
    // every split stays a single, local operation.
    fn leaf_apply(
        &mut self,
        path: &[S::Pointer],
        ptr: S::Pointer,
        ops: Vec<Op<K, V>>,
    ) -> Result<()> {
        let mut leaf = self.store.get(&ptr)?;
        let mut ops = VecDeque::from(ops);
        while let Some(op) = ops.pop_front() {
            match self.search_keys(&leaf.keys, &op.key) {
                // first writer wins, the buffered duplicate is dropped
                Ok(_) => continue,
                Err(idx) => {
                    leaf.keys.insert(idx, op.key);
                    leaf.values.insert(idx, op.value);
                }
            }
            if leaf.keys.len() >= self.order {
                self.split_leaf_once(path, ptr.clone(), leaf)?;
                while let Some(rest) = ops.pop_front() {
                    self.insert_direct(rest)?;
                }
                return Ok(());
            }
        }
        self.store.update(&ptr, leaf)
    }

    // A plain, non-buffering insert of one operation, used to drain buffers
    // and to finish oversized batches.
    fn insert_direct(&mut self, op: Op<K, V>) -> Result<()> {
        let mut path: Vec<S::Pointer> = Vec::new();
        let mut current = self.root.clone();
        loop {
            self.check_cancel()?;
            let node = self.store.get(&current)?;
            if node.is_leaf() {
                return self.leaf_apply(&path, current, vec![op]);
            }
            let idx = self.child_index(&node, &op.key);
            path.push(current);
            current = node.pointers[idx].clone();
        }
    }

    // Splits a leaf that reached `order` keys. The upper half moves to a new
    // leaf, the chain is relinked, and the split key propagates upward.
    fn split_leaf_once(
        &mut self,
        path: &[S::Pointer],
        ptr: S::Pointer,
        mut leaf: Node<K, V, S::Pointer>,
    ) -> Result<()> {
        let mid = leaf.keys.len() / 2;
        let upper_keys = leaf.keys.split_off(mid);
        let upper_values = leaf.values.split_off(mid);
        let sep = upper_keys[0].clone();
        let new_leaf = Node {
            version: NODE_VERSION,
            keys: upper_keys,
            pointers: Vec::new(),
            values: upper_values,
            next: leaf.next.take(),
            ops: Vec::new(),
        };
        let new_ptr = self.store.put(new_leaf)?;
        leaf.next = Some(new_ptr.clone());
        self.store.update(&ptr, leaf)?;
        self.insert_into_parent(path, sep, new_ptr)
    }

    // Inserts a separator and its right-hand child into the parent of a node
    // that just split. `path` holds the ancestors of the split node; an
    // empty path means the root split and the tree grows a level.
    fn insert_into_parent(
        &mut self,
        path: &[S::Pointer],
        sep: K,
        new_ptr: S::Pointer,
    ) -> Result<()> {
        if path.is_empty() {
            let new_root = Node {
                version: NODE_VERSION,
                keys: vec![sep],
                pointers: vec![self.root.clone(), new_ptr],
                values: Vec::new(),
                next: None,
                ops: Vec::new(),
            };
            self.root = self.store.put(new_root)?;
            return Ok(());
        }
        let parent_ptr = path[path.len() - 1].clone();
        let mut parent = self.store.get(&parent_ptr)?;
        let idx = self.lower_bound(&parent.keys, &sep);
        parent.keys.insert(idx, sep);
        parent.pointers.insert(idx + 1, new_ptr);
        if parent.pointers.len() > self.order {
            self.split_internal(&path[..path.len() - 1], parent_ptr, parent)
        } else {
            self.store.update(&parent_ptr, parent)
        }
    }

    // Splits an internal node whose fan-out exceeded the order. The middle
    // key moves up; buffered ops partition across the halves.
    fn split_internal(
        &mut self,
        path: &[S::Pointer],
        ptr: S::Pointer,
        mut node: Node<K, V, S::Pointer>,
    ) -> Result<()> {
        let mid = node.keys.len() / 2;
        let sep = node.keys[mid].clone();
        let right_keys = node.keys.split_off(mid + 1);
        node.keys.pop();
        let right_pointers = node.pointers.split_off(mid + 1);
        let mut left_ops = Vec::new();
        let mut right_ops = Vec::new();
        for op in node.ops.drain(..) {
            // equality descends right, like the search does
            if self.ordering.cmp(&op.key, &sep) == Ordering::Less {
                left_ops.push(op);
            } else {
                right_ops.push(op);
            }
        }
        node.ops = left_ops;
        let right = Node {
            version: NODE_VERSION,
            keys: right_keys,
            pointers: right_pointers,
            values: Vec::new(),
            next: None,
            ops: right_ops,
        };
        let right_ptr = self.store.put(right)?;
        self.store.update(&ptr, node)?;
        self.insert_into_parent(path, sep, right_ptr)
    }

    // Index of the child a key descends into: the count of keys <= key,
    // which gives equality the right-branch bias.
    pub(crate) fn child_index(&self, node: &Node<K, V, S::Pointer>, key: &K) -> usize {
        let mut lo = 0;
        let mut hi = node.keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.ordering.cmp(&node.keys[mid], key) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    // Binary search under the tree ordering. Ok(i) when keys[i] == key,
    // Err(i) with the insertion position otherwise.
    pub(crate) fn search_keys(&self, keys: &[K], key: &K) -> std::result::Result<usize, usize> {
        let mut lo = 0;
        let mut hi = keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.ordering.cmp(&keys[mid], key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    // Count of keys strictly below `key`.
    fn lower_bound(&self, keys: &[K], key: &K) -> usize {
        let mut lo = 0;
        let mut hi = keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.ordering.cmp(&keys[mid], key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub(crate) fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Canceled),
            _ => Ok(()),
        }
    }
}
