//! Freezing a live tree into write-once storage.
//!
//! Content-addressed backends only support `put`: a node's pointer is not
//! known until the node is written, and a written node can never change.
//! Persisting therefore walks the tree post-order and right-to-left, so
//! that by the time a leaf is written its successor already has a pointer,
//! and by the time an internal node is written all of its children do. The
//! rightmost leaf goes first and carries no `next`.
//!
//! A value mapper runs over every leaf entry on the way out, allowing the
//! persisted tree to hold a different value type than the live one.

use crate::node::{Node, NODE_VERSION};
use crate::{BTree, KeyOrdering, NodeStore, Result};

impl<K, V, S, C> BTree<K, V, S, C>
where
    K: Clone,
    V: Clone,
    S: NodeStore<K, V>,
    C: KeyOrdering<K>,
{
    /// Writes a frozen copy of this tree into `target` and returns the
    /// pointer of the persisted root.
    ///
    /// Buffered operations are drained to the leaves first, so the persisted
    /// tree reflects every insert issued before the call.
    pub fn persist<W, T, F>(&mut self, target: &mut T, mut map: F) -> Result<T::Pointer>
    where
        W: Clone,
        T: NodeStore<K, W>,
        F: FnMut(&K, &V) -> Result<W>,
    {
        self.flush_ops()?;
        let root = self.root.clone();
        let mut prev_leaf: Option<T::Pointer> = None;
        self.persist_node(&root, target, &mut map, &mut prev_leaf)
    }

    fn persist_node<W, T, F>(
        &mut self,
        ptr: &S::Pointer,
        target: &mut T,
        map: &mut F,
        prev_leaf: &mut Option<T::Pointer>,
    ) -> Result<T::Pointer>
    where
        W: Clone,
        T: NodeStore<K, W>,
        F: FnMut(&K, &V) -> Result<W>,
    {
        self.check_cancel()?;
        let node = self.store.get(ptr)?;
        if node.is_leaf() {
            let mut values = Vec::with_capacity(node.values.len());
            for (key, value) in node.keys.iter().zip(node.values.iter()) {
                values.push(map(key, value)?);
            }
            let frozen = Node {
                version: NODE_VERSION,
                keys: node.keys.clone(),
                pointers: Vec::new(),
                values,
                next: prev_leaf.clone(),
                ops: Vec::new(),
            };
            let new_ptr = target.put(frozen)?;
            *prev_leaf = Some(new_ptr.clone());
            return Ok(new_ptr);
        }
        // children are written right-to-left, so collect their new
        // pointers reversed and flip the list once at the end
        let mut pointers = Vec::with_capacity(node.pointers.len());
        for child in node.pointers.iter().rev() {
            pointers.push(self.persist_node(child, target, map, prev_leaf)?);
        }
        pointers.reverse();
        let frozen = Node {
            version: NODE_VERSION,
            keys: node.keys.clone(),
            pointers,
            values: Vec::new(),
            next: None,
            ops: Vec::new(),
        };
        target.put(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryNodeStore;
    use crate::node::Descriptor;

    #[test]
    fn persist_round_trip() {
        let mut live = BTree::new(MemoryNodeStore::new(), 4).unwrap();
        for i in 0..200_u64 {
            live.insert(format!("{:04}", i), i).unwrap();
        }
        let mut frozen_store = MemoryNodeStore::new();
        let root = live.persist(&mut frozen_store, |_k, v| Ok(*v)).unwrap();
        let descriptor = Descriptor {
            version: NODE_VERSION,
            order: 4,
            count: live.len(),
            root,
        };
        let mut frozen = BTree::from_storage(frozen_store, descriptor);
        for i in 0..200_u64 {
            assert_eq!(frozen.find(&format!("{:04}", i)).unwrap(), Some(i));
        }
        let pairs: Vec<_> = frozen.scan().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(pairs.len(), 200);
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
        frozen.verify().unwrap();
    }

    #[test]
    fn persist_maps_values() {
        let mut live = BTree::new(MemoryNodeStore::new(), 3).unwrap();
        for i in 0..20_u64 {
            live.insert(format!("{:02}", i), i).unwrap();
        }
        let mut frozen_store: MemoryNodeStore<String, String> = MemoryNodeStore::new();
        let root = live
            .persist(&mut frozen_store, |_k, v| Ok(format!("value-{}", v)))
            .unwrap();
        let descriptor = Descriptor {
            version: NODE_VERSION,
            order: 3,
            count: live.len(),
            root,
        };
        let mut frozen = BTree::from_storage(frozen_store, descriptor);
        assert_eq!(
            frozen.find(&"07".to_string()).unwrap(),
            Some("value-7".to_string())
        );
    }

    #[test]
    fn rightmost_leaf_is_written_first() {
        let mut live = BTree::new(MemoryNodeStore::new(), 3).unwrap();
        for i in 0..30_u64 {
            live.insert(format!("{:02}", i), i).unwrap();
        }
        let mut frozen_store: MemoryNodeStore<String, u64> = MemoryNodeStore::new();
        live.persist(&mut frozen_store, |_k, v| Ok(*v)).unwrap();
        // pointer 0 in a fresh memory store is the first node written; it
        // must be the rightmost leaf, which has no successor
        let first = frozen_store.get(&0).unwrap();
        assert!(first.is_leaf());
        assert!(first.next.is_none());
        assert_eq!(first.keys.last().unwrap(), "29");
    }
}
