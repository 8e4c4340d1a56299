use kloset_btree::mem::MemoryNodeStore;
use kloset_btree::{BTree, Descriptor, Error, NODE_VERSION};

use quickcheck_macros::quickcheck;
use rand::distributions::Alphanumeric;
use rand::prelude::*;

use std::collections::{BTreeMap, HashSet};

fn alphabet_tree() -> BTree<char, i64, MemoryNodeStore<char, i64>> {
    let mut tree = BTree::new(MemoryNodeStore::new(), 3).unwrap();
    for (i, c) in ('a'..='z').enumerate() {
        tree.insert(c, i as i64).unwrap();
    }
    tree
}

#[test]
fn alphabet_order_three() {
    let mut tree = alphabet_tree();
    assert_eq!(tree.len(), 26);
    assert_eq!(tree.find(&'m').unwrap(), Some(12));

    let pairs: Vec<_> = tree.scan().unwrap().map(|r| r.unwrap()).collect();
    let expected: Vec<_> = ('a'..='z').enumerate().map(|(i, c)| (c, i as i64)).collect();
    assert_eq!(pairs, expected);

    let tail: Vec<_> = tree.scan_from(&'e').unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(tail.first(), Some(&('e', 4)));
    assert_eq!(tail.len(), 22);

    let mut reversed: Vec<_> = tree.scan_reverse().unwrap().map(|r| r.unwrap()).collect();
    reversed.reverse();
    assert_eq!(reversed, expected);

    tree.verify().unwrap();
}

#[test]
fn alphabet_persists_into_a_second_store() {
    let mut tree = alphabet_tree();
    let mut frozen_store = MemoryNodeStore::new();
    let root = tree.persist(&mut frozen_store, |_k, v| Ok(*v)).unwrap();
    let descriptor = Descriptor {
        version: NODE_VERSION,
        order: tree.order(),
        count: tree.len(),
        root,
    };
    let mut frozen = BTree::from_storage(frozen_store, descriptor);
    assert_eq!(frozen.find(&'m').unwrap(), Some(12));
    let pairs: Vec<_> = frozen.scan().unwrap().map(|r| r.unwrap()).collect();
    let expected: Vec<_> = ('a'..='z').enumerate().map(|(i, c)| (c, i as i64)).collect();
    assert_eq!(pairs, expected);
    frozen.verify().unwrap();
}

#[test]
fn ten_thousand_random_strings() {
    let mut rng = rand::thread_rng();
    let mut keys = HashSet::new();
    while keys.len() < 10_000 {
        let key: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        keys.insert(key);
    }
    let mut tree = BTree::new(MemoryNodeStore::new(), 50).unwrap();
    for (i, key) in keys.iter().enumerate() {
        tree.insert(key.clone(), i as u64).unwrap();
    }
    assert_eq!(tree.len(), 10_000);
    tree.verify().unwrap();

    let mut sorted: Vec<_> = keys.into_iter().collect();
    sorted.sort();
    let scanned: Vec<_> = tree
        .scan()
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(scanned, sorted);
}

#[quickcheck]
fn matches_a_model_map(entries: Vec<(String, u32)>) -> bool {
    let mut tree = BTree::new(MemoryNodeStore::new(), 5).unwrap();
    let mut model: BTreeMap<String, u32> = BTreeMap::new();
    for (key, value) in entries {
        match tree.insert(key.clone(), value) {
            Ok(()) => {
                // a fresh key must not have been in the model
                if model.insert(key, value).is_some() {
                    return false;
                }
            }
            Err(Error::Exists) => {
                if !model.contains_key(&key) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
    if tree.len() != model.len() as u64 {
        return false;
    }
    if tree.verify().is_err() {
        return false;
    }
    let scanned: Vec<_> = tree.scan().unwrap().map(|r| r.unwrap()).collect();
    let expected: Vec<_> = model.into_iter().collect();
    scanned == expected
}
