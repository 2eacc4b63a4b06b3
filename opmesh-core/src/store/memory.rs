//! In memory storage.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::store::{BatchOp, IterDir, StorageAdapter};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// An ordered in-memory store.
///
/// Cloning returns a new handle onto the same map.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    map: Arc<RwLock<Map>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl StorageAdapter for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.map.read().contains_key(key))
    }

    fn iter(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        dir: IterDir,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read();
        let lower = start.unwrap_or(prefix);
        let range = map.range::<[u8], _>((Bound::Included(lower), Bound::Unbounded));
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = range
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if dir == IterDir::Reverse {
            out.reverse();
        }
        Ok(out)
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut map = self.map.write();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_prefix_and_start() {
        let store = MemStore::new();
        store.put(b"a1", b"1").unwrap();
        store.put(b"a2", b"2").unwrap();
        store.put(b"a3", b"3").unwrap();
        store.put(b"b1", b"x").unwrap();

        let all = store.iter(b"a", None, IterDir::Forward).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, b"a1");

        let from = store.iter(b"a", Some(b"a2"), IterDir::Forward).unwrap();
        assert_eq!(from.len(), 2);
        assert_eq!(from[0].0, b"a2");

        let rev = store.iter(b"a", None, IterDir::Reverse).unwrap();
        assert_eq!(rev[0].0, b"a3");
    }

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemStore::new();
        store
            .batch(vec![
                BatchOp::Put(b"k".to_vec(), b"v1".to_vec()),
                BatchOp::Put(b"k".to_vec(), b"v2".to_vec()),
                BatchOp::Put(b"gone".to_vec(), b"x".to_vec()),
                BatchOp::Delete(b"gone".to_vec()),
            ])
            .unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert!(!store.has(b"gone").unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clone_shares_state() {
        let a = MemStore::new();
        let b = a.clone();
        a.put(b"k", b"v").unwrap();
        assert!(b.has(b"k").unwrap());
    }
}
