//! The write-back node cache.
//!
//! A bounded LRU of `2 · order` nodes sits between the tree and its store.
//! `update` only marks the cached copy dirty; the write reaches the store
//! when the entry is evicted or on [`NodeCache::flush`]. Dropping the cache
//! discards dirty nodes: a cancelled or failed operation leaves the store
//! as it was, and owners flush explicitly on the success path.

use crate::node::Node;
use crate::{NodeStore, Result};

use lru::LruCache;

struct Slot<K, V, P> {
    node: Node<K, V, P>,
    dirty: bool,
}

pub struct NodeCache<K, V, S: NodeStore<K, V>> {
    inner: S,
    cache: LruCache<S::Pointer, Slot<K, V, S::Pointer>>,
}

impl<K, V, S> NodeCache<K, V, S>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
{
    pub fn new(inner: S, capacity: usize) -> NodeCache<K, V, S> {
        NodeCache {
            inner,
            cache: LruCache::new(capacity.max(1)),
        }
    }

    /// Fetches a node, populating the cache on a miss.
    pub fn get(&mut self, ptr: &S::Pointer) -> Result<Node<K, V, S::Pointer>> {
        if let Some(slot) = self.cache.get(ptr) {
            return Ok(slot.node.clone());
        }
        let node = self.inner.get(ptr)?;
        self.install(
            ptr.clone(),
            Slot {
                node: node.clone(),
                dirty: false,
            },
        )?;
        Ok(node)
    }

    /// Replaces a node. The write is deferred until eviction or flush.
    pub fn update(&mut self, ptr: &S::Pointer, node: Node<K, V, S::Pointer>) -> Result<()> {
        self.install(ptr.clone(), Slot { node, dirty: true })
    }

    /// Allocates a node in the underlying store and caches it clean.
    pub fn put(&mut self, node: Node<K, V, S::Pointer>) -> Result<S::Pointer> {
        let ptr = self.inner.put(node.clone())?;
        self.install(ptr.clone(), Slot { node, dirty: false })?;
        Ok(ptr)
    }

    /// Writes every dirty node back to the store.
    pub fn flush(&mut self) -> Result<()> {
        // iter_mut does not reorder the LRU list
        for (ptr, slot) in self.cache.iter_mut() {
            if slot.dirty {
                self.inner.update(ptr, slot.node.clone())?;
                slot.dirty = false;
            }
        }
        Ok(())
    }

    fn install(&mut self, ptr: S::Pointer, slot: Slot<K, V, S::Pointer>) -> Result<()> {
        if let Some((evicted_ptr, evicted)) = self.cache.push(ptr.clone(), slot) {
            // push returns either the entry we replaced under the same key
            // (already superseded, drop it) or the LRU victim, which must be
            // written back if dirty
            if evicted_ptr != ptr && evicted.dirty {
                self.inner.update(&evicted_ptr, evicted.node)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryNodeStore;
    use crate::node::NODE_VERSION;

    fn leaf_with_key(key: u64) -> Node<u64, u64, u64> {
        Node {
            version: NODE_VERSION,
            keys: vec![key],
            pointers: Vec::new(),
            values: vec![key],
            next: None,
            ops: Vec::new(),
        }
    }

    #[test]
    fn writes_are_deferred_until_flush() {
        let mut store = MemoryNodeStore::new();
        let ptr = store.put(leaf_with_key(1)).unwrap();
        let mut cache = NodeCache::new(store, 8);
        let mut node = cache.get(&ptr).unwrap();
        node.keys = vec![2];
        node.values = vec![2];
        cache.update(&ptr, node).unwrap();
        // the inner store still has the old node
        assert_eq!(cache.inner.get(&ptr).unwrap().keys, vec![1]);
        cache.flush().unwrap();
        assert_eq!(cache.inner.get(&ptr).unwrap().keys, vec![2]);
    }

    #[test]
    fn eviction_writes_back_dirty_nodes() {
        let mut cache = NodeCache::new(MemoryNodeStore::new(), 2);
        let a = cache.put(leaf_with_key(1)).unwrap();
        let mut node = cache.get(&a).unwrap();
        node.keys = vec![9];
        node.values = vec![9];
        cache.update(&a, node).unwrap();
        // push two more nodes, evicting `a`
        cache.put(leaf_with_key(2)).unwrap();
        cache.put(leaf_with_key(3)).unwrap();
        assert_eq!(cache.inner.get(&a).unwrap().keys, vec![9]);
    }
}
