//! The storage seam and the shared key layout.
//!
//! The core persists through [`StorageAdapter`], a small synchronous
//! key-value contract. Backends only need ordered prefix iteration and an
//! atomic batch; everything else is built on top. [`MemStore`] is the
//! in-memory backend used by tests and ephemeral nodes.

use opmesh_base::{Id, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::merkle::MerkleLevel;
use crate::oplog::LogHash;

pub mod memory;

pub use memory::MemStore;

/// Iteration direction for [`StorageAdapter::iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterDir {
    Forward,
    Reverse,
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// The index record guarding a multi-key object write.
///
/// Lists every key the object occupies so a later overwrite or delete can
/// clean all of them, and carries the object's update time for
/// conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub keys: Vec<Vec<u8>>,
    pub update_ts: Timestamp,
}

/// Synchronous ordered key-value storage.
///
/// Implementations must be safe to share across tasks; iteration returns a
/// snapshot so callers never hold a backend lock across their own work.
pub trait StorageAdapter: Send + Sync + std::fmt::Debug + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Snapshot of all pairs under `prefix`, starting at `start` (or the
    /// prefix itself when `None`), in `dir` order.
    fn iter(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        dir: IterDir,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies every mutation or none.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Writes an object and its index atomically.
    ///
    /// When an index already exists under `idx_key`: fails with
    /// [`Error::AlreadyExists`] unless `allow_overwrite`; when
    /// `check_update_ts`, a stored index with a strictly newer `update_ts`
    /// also refuses the write. Stale keys owned by the old index and not
    /// rewritten are deleted. Returns `true` when the write happened.
    fn try_put_all(
        &self,
        idx_key: &[u8],
        idx: &IndexEntry,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
        allow_overwrite: bool,
        check_update_ts: bool,
    ) -> Result<bool> {
        let mut ops = Vec::with_capacity(kvs.len() + 4);
        if let Some(raw) = self.get(idx_key)? {
            let old: IndexEntry =
                postcard::from_bytes(&raw).map_err(|_| Error::Db("bad index entry".into()))?;
            if !allow_overwrite {
                return Err(Error::AlreadyExists);
            }
            if check_update_ts && old.update_ts > idx.update_ts {
                return Ok(false);
            }
            for key in &old.keys {
                if !idx.keys.contains(key) {
                    ops.push(BatchOp::Delete(key.clone()));
                }
            }
        }
        let raw =
            postcard::to_stdvec(idx).map_err(|_| Error::Db("index encode failed".into()))?;
        ops.push(BatchOp::Put(idx_key.to_vec(), raw));
        for (k, v) in kvs {
            ops.push(BatchOp::Put(k, v));
        }
        self.batch(ops)?;
        Ok(true)
    }

    /// Deletes an object and every key its index lists.
    fn delete_all(&self, idx_key: &[u8]) -> Result<()> {
        let Some(raw) = self.get(idx_key)? else {
            return Ok(());
        };
        let old: IndexEntry =
            postcard::from_bytes(&raw).map_err(|_| Error::Db("bad index entry".into()))?;
        let mut ops: Vec<BatchOp> = old.keys.into_iter().map(BatchOp::Delete).collect();
        ops.push(BatchOp::Delete(idx_key.to_vec()));
        self.batch(ops)
    }
}

/// Key builders for one oplog family inside one entity.
///
/// Every key starts with the family prefix and the entity id, so one backend
/// can host many entities and families without collision. Layout:
///
/// ```text
/// <prefix> <entity_id> "o"  <obj_id>                      object record
/// <prefix> <entity_id> "i"  <obj_id>                      object index
/// <prefix> <entity_id> "l"  <update_ts:12> <oplog_id>     oplog, time order
/// <prefix> <entity_id> "x"  <oplog_id>                    oplog id index
/// <prefix> <entity_id> "p"  <update_ts:12> <oplog_id>     pending oplog
/// <prefix> <entity_id> "n"  <update_ts:12> <oplog_id>     internal oplog
/// <prefix> <entity_id> "m"  <level> <bucket_ts:12> <addr> merkle node
/// <prefix> <entity_id> "w"  <name>                        merkle watermark
/// <prefix> <entity_id> "h"  <name>                        family metadata
/// ```
#[derive(Debug, Clone)]
pub struct FamilyKeys {
    prefix: Vec<u8>,
}

impl FamilyKeys {
    pub fn new(family_prefix: &[u8], entity_id: Id) -> Self {
        let mut prefix = Vec::with_capacity(family_prefix.len() + Id::LEN);
        prefix.extend_from_slice(family_prefix);
        prefix.extend_from_slice(entity_id.as_bytes());
        FamilyKeys { prefix }
    }

    fn with(&self, marker: u8, rest: &[&[u8]]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(marker);
        for part in rest {
            key.extend_from_slice(part);
        }
        key
    }

    pub fn object(&self, obj_id: Id) -> Vec<u8> {
        self.with(b'o', &[obj_id.as_bytes()])
    }

    pub fn object_prefix(&self) -> Vec<u8> {
        self.with(b'o', &[])
    }

    pub fn object_idx(&self, obj_id: Id) -> Vec<u8> {
        self.with(b'i', &[obj_id.as_bytes()])
    }

    pub fn oplog(&self, update_ts: Timestamp, oplog_id: Id) -> Vec<u8> {
        self.with(b'l', &[&update_ts.to_bytes(), oplog_id.as_bytes()])
    }

    pub fn oplog_prefix(&self) -> Vec<u8> {
        self.with(b'l', &[])
    }

    pub fn oplog_ts_prefix(&self, update_ts: Timestamp) -> Vec<u8> {
        self.with(b'l', &[&update_ts.to_bytes()])
    }

    pub fn oplog_idx(&self, oplog_id: Id) -> Vec<u8> {
        self.with(b'x', &[oplog_id.as_bytes()])
    }

    pub fn pending_oplog(&self, update_ts: Timestamp, oplog_id: Id) -> Vec<u8> {
        self.with(b'p', &[&update_ts.to_bytes(), oplog_id.as_bytes()])
    }

    pub fn pending_oplog_prefix(&self) -> Vec<u8> {
        self.with(b'p', &[])
    }

    pub fn internal_oplog(&self, update_ts: Timestamp, oplog_id: Id) -> Vec<u8> {
        self.with(b'n', &[&update_ts.to_bytes(), oplog_id.as_bytes()])
    }

    pub fn internal_oplog_prefix(&self) -> Vec<u8> {
        self.with(b'n', &[])
    }

    pub fn merkle(&self, level: MerkleLevel, bucket_ts: Timestamp, addr: &LogHash) -> Vec<u8> {
        self.with(b'm', &[&[level as u8], &bucket_ts.to_bytes(), addr])
    }

    pub fn merkle_level_prefix(&self, level: MerkleLevel) -> Vec<u8> {
        self.with(b'm', &[&[level as u8]])
    }

    pub fn merkle_level_ts_prefix(&self, level: MerkleLevel, bucket_ts: Timestamp) -> Vec<u8> {
        self.with(b'm', &[&[level as u8], &bucket_ts.to_bytes()])
    }

    pub fn merkle_meta(&self, name: &[u8]) -> Vec<u8> {
        self.with(b'w', &[name])
    }

    pub fn meta(&self, name: &[u8]) -> Vec<u8> {
        self.with(b'h', &[name])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;

    fn keys() -> FamilyKeys {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(1);
        FamilyKeys::new(b"tst", Id::random(&mut rng))
    }

    #[test]
    fn test_oplog_keys_sort_by_time() {
        let keys = keys();
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(2);
        let id = Id::random(&mut rng);
        let a = keys.oplog(Timestamp::new(10, 0), id);
        let b = keys.oplog(Timestamp::new(10, 1), id);
        let c = keys.oplog(Timestamp::new(11, 0), id);
        assert!(a < b && b < c);
        assert!(a.starts_with(&keys.oplog_prefix()));
    }

    #[test]
    fn test_markers_disjoint() {
        let keys = keys();
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(3);
        let id = Id::random(&mut rng);
        let object = keys.object(id);
        let oplog = keys.oplog(Timestamp::ZERO, id);
        assert!(!object.starts_with(&keys.oplog_prefix()));
        assert!(!oplog.starts_with(&keys.object_prefix()));
    }

    #[test]
    fn test_try_put_all_guards() {
        let store = MemStore::default();
        let keys = keys();
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(4);
        let obj = Id::random(&mut rng);
        let idx_key = keys.object_idx(obj);
        let data_key = keys.object(obj);

        let idx = IndexEntry {
            keys: vec![data_key.clone()],
            update_ts: Timestamp::new(5, 0),
        };
        assert!(store
            .try_put_all(&idx_key, &idx, vec![(data_key.clone(), b"v1".to_vec())], false, false)
            .unwrap());

        // second create refused
        assert!(matches!(
            store.try_put_all(&idx_key, &idx, vec![], false, false),
            Err(Error::AlreadyExists)
        ));

        // stale overwrite refused when checking timestamps
        let stale = IndexEntry {
            keys: vec![data_key.clone()],
            update_ts: Timestamp::new(4, 0),
        };
        assert!(!store
            .try_put_all(&idx_key, &stale, vec![(data_key.clone(), b"old".to_vec())], true, true)
            .unwrap());
        assert_eq!(store.get(&data_key).unwrap(), Some(b"v1".to_vec()));

        // newer overwrite applies and removes keys the new index dropped
        let extra_key = keys.merkle_meta(b"extra");
        store.put(&extra_key, b"junk").unwrap();
        let old_with_extra = IndexEntry {
            keys: vec![data_key.clone(), extra_key.clone()],
            update_ts: Timestamp::new(5, 0),
        };
        let raw = postcard::to_stdvec(&old_with_extra).unwrap();
        store.put(&idx_key, &raw).unwrap();

        let newer = IndexEntry {
            keys: vec![data_key.clone()],
            update_ts: Timestamp::new(6, 0),
        };
        assert!(store
            .try_put_all(&idx_key, &newer, vec![(data_key.clone(), b"v2".to_vec())], true, true)
            .unwrap());
        assert_eq!(store.get(&data_key).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get(&extra_key).unwrap(), None);
    }

    #[test]
    fn test_delete_all() {
        let store = MemStore::default();
        let keys = keys();
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(5);
        let obj = Id::random(&mut rng);
        let idx_key = keys.object_idx(obj);
        let data_key = keys.object(obj);
        let idx = IndexEntry {
            keys: vec![data_key.clone()],
            update_ts: Timestamp::ZERO,
        };
        store
            .try_put_all(&idx_key, &idx, vec![(data_key.clone(), b"v".to_vec())], false, false)
            .unwrap();
        store.delete_all(&idx_key).unwrap();
        assert!(!store.has(&data_key).unwrap());
        assert!(!store.has(&idx_key).unwrap());
    }
}
