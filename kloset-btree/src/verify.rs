//! Structural verification.
//!
//! `verify` walks the whole tree and checks the shape invariants: key
//! ordering inside every node, parent/child key bounds, occupancy, uniform
//! leaf depth, and the integrity of the leaf chain. It reports the first
//! violation found with enough context to locate the offending node.
//!
//! The violations returned here are diagnostics about the tree being
//! inspected, which may well be corrupt; they are reported as ordinary
//! errors in every build profile, unlike internal invariant breaches,
//! which panic in debug builds.

use crate::node::Node;
use crate::{BTree, Error, KeyOrdering, NodeStore, Result};

use std::cmp::Ordering;

impl<K, V, S, C> BTree<K, V, S, C>
where
    K: Clone + std::fmt::Debug,
    V: Clone,
    S: NodeStore<K, V>,
    C: KeyOrdering<K>,
{
    /// Checks every structural invariant of the tree.
    pub fn verify(&mut self) -> Result<()> {
        let root = self.root.clone();
        let mut leaves: Vec<(S::Pointer, Option<S::Pointer>)> = Vec::new();
        let mut leaf_depth: Option<usize> = None;
        self.verify_node(&root, 0, None, None, true, &mut leaves, &mut leaf_depth)?;
        // the DFS pushed leaves left-to-right; the chain must link them in
        // exactly that order
        for window in leaves.windows(2) {
            let (_, next) = &window[0];
            let (successor, _) = &window[1];
            if next.as_ref() != Some(successor) {
                return Err(Error::Invariant(format!(
                    "leaf chain skips {:?}",
                    successor
                )));
            }
        }
        if let Some((_, next)) = leaves.last() {
            if next.is_some() {
                return Err(Error::Invariant(
                    "last leaf has a successor".to_string(),
                ));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_node(
        &mut self,
        ptr: &S::Pointer,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
        leaves: &mut Vec<(S::Pointer, Option<S::Pointer>)>,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        self.check_cancel()?;
        let node = self.store.get(ptr)?;
        self.check_keys_sorted(&node, ptr)?;
        self.check_bounds(&node, ptr, lower, upper)?;
        if node.is_leaf() {
            self.check_leaf_shape(&node, ptr, is_root)?;
            match leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if *expected != depth => {
                    return Err(Error::Invariant(format!(
                        "leaf {:?} at depth {}, expected {}",
                        ptr, depth, expected
                    )));
                }
                _ => {}
            }
            leaves.push((ptr.clone(), node.next.clone()));
            return Ok(());
        }
        self.check_internal_shape(&node, ptr, is_root)?;
        for (idx, child) in node.pointers.clone().iter().enumerate() {
            // child i is bounded by the flanking separators: keys[i-1]
            // inclusive below, keys[i] exclusive above
            let child_lower = if idx == 0 { lower } else { Some(&node.keys[idx - 1]) };
            let child_upper = if idx == node.keys.len() {
                upper
            } else {
                Some(&node.keys[idx])
            };
            self.verify_node(
                child,
                depth + 1,
                child_lower,
                child_upper,
                false,
                leaves,
                leaf_depth,
            )?;
        }
        Ok(())
    }

    fn check_keys_sorted(&self, node: &Node<K, V, S::Pointer>, ptr: &S::Pointer) -> Result<()> {
        for window in node.keys.windows(2) {
            if self.ordering.cmp(&window[0], &window[1]) != Ordering::Less {
                return Err(Error::Invariant(format!(
                    "keys out of order in node {:?}",
                    ptr
                )));
            }
        }
        Ok(())
    }

    fn check_bounds(
        &self,
        node: &Node<K, V, S::Pointer>,
        ptr: &S::Pointer,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<()> {
        for key in &node.keys {
            if let Some(lower) = lower {
                if self.ordering.cmp(key, lower) == Ordering::Less {
                    return Err(Error::Invariant(format!(
                        "key {:?} in node {:?} below its parent bound",
                        key, ptr
                    )));
                }
            }
            if let Some(upper) = upper {
                if self.ordering.cmp(key, upper) != Ordering::Less {
                    return Err(Error::Invariant(format!(
                        "key {:?} in node {:?} at or above its parent bound",
                        key, ptr
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_leaf_shape(
        &self,
        node: &Node<K, V, S::Pointer>,
        ptr: &S::Pointer,
        is_root: bool,
    ) -> Result<()> {
        if node.values.len() != node.keys.len() {
            return Err(Error::Invariant(format!(
                "leaf {:?} has {} keys but {} values",
                ptr,
                node.keys.len(),
                node.values.len()
            )));
        }
        if !node.ops.is_empty() {
            return Err(Error::Invariant(format!(
                "leaf {:?} carries buffered ops",
                ptr
            )));
        }
        if node.keys.len() >= self.order {
            return Err(Error::Invariant(format!(
                "leaf {:?} overflows the order",
                ptr
            )));
        }
        if !is_root && node.keys.len() < self.order / 2 {
            return Err(Error::Invariant(format!(
                "leaf {:?} under-occupied ({} keys)",
                ptr,
                node.keys.len()
            )));
        }
        Ok(())
    }

    fn check_internal_shape(
        &self,
        node: &Node<K, V, S::Pointer>,
        ptr: &S::Pointer,
        is_root: bool,
    ) -> Result<()> {
        if !node.values.is_empty() {
            return Err(Error::Invariant(format!(
                "internal node {:?} carries values",
                ptr
            )));
        }
        if node.pointers.len() != node.keys.len() + 1 {
            return Err(Error::Invariant(format!(
                "internal node {:?} has {} keys but {} children",
                ptr,
                node.keys.len(),
                node.pointers.len()
            )));
        }
        if node.pointers.len() > self.order {
            return Err(Error::Invariant(format!(
                "internal node {:?} overflows the order",
                ptr
            )));
        }
        let min_pointers = if is_root { 2 } else { (self.order + 1) / 2 };
        if node.pointers.len() < min_pointers {
            return Err(Error::Invariant(format!(
                "internal node {:?} under-occupied ({} children)",
                ptr,
                node.pointers.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryNodeStore;

    #[test]
    fn verify_accepts_insert_built_trees() {
        for order in [3_usize, 4, 5, 8].iter() {
            let mut tree = BTree::new(MemoryNodeStore::new(), *order).unwrap();
            for i in 0..500_u64 {
                tree.insert(format!("{:05}", i), i).unwrap();
            }
            tree.verify().unwrap();
        }
    }

    #[test]
    fn verify_accepts_reverse_insertion_order() {
        let mut tree = BTree::new(MemoryNodeStore::new(), 4).unwrap();
        for i in (0..500_u64).rev() {
            tree.insert(format!("{:05}", i), i).unwrap();
        }
        tree.verify().unwrap();
    }

    #[test]
    fn verify_detects_misordered_keys() {
        let mut tree = BTree::new(MemoryNodeStore::new(), 3).unwrap();
        for i in 0..10_u64 {
            tree.insert(format!("{:02}", i), i).unwrap();
        }
        // corrupt the tree by swapping two keys in the leftmost leaf
        let mut ptr = tree.root;
        loop {
            let n = tree.store.get(&ptr).unwrap();
            if n.is_leaf() {
                break;
            }
            ptr = n.pointers[0].clone();
        }
        let mut leaf = tree.store.get(&ptr).unwrap();
        leaf.keys.swap(0, 1);
        tree.store.update(&ptr, leaf).unwrap();
        assert!(tree.verify().is_err());
    }
}
