//! Time-bucketed merkle index over a family's oplogs.
//!
//! Leaf nodes at the `Now` level carry one oplog hash each, keyed by the
//! oplog's `update_ts`. Above them sit hour, day, month and year nodes whose
//! address is the blake3 of their children's sorted addresses. Two replicas
//! compare top-level nodes and walk down only through buckets that differ,
//! then reconcile the leaf key sets of the differing hour.

use std::sync::Arc;

use opmesh_base::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::oplog::{LogHash, Oplog, ZERO_HASH};
use crate::store::{BatchOp, FamilyKeys, IterDir, StorageAdapter};

/// Meta key names for the index watermarks.
const META_GENERATE: &[u8] = b"generate";
const META_SYNC: &[u8] = b"sync";
const META_FAIL_SYNC: &[u8] = b"fail-sync";
const META_DIRTY: &[u8] = b"dirty";

/// One tier of the index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MerkleLevel {
    Now = 0,
    Hour = 1,
    Day = 2,
    Month = 3,
    Year = 4,
}

impl MerkleLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MerkleLevel::Now),
            1 => Some(MerkleLevel::Hour),
            2 => Some(MerkleLevel::Day),
            3 => Some(MerkleLevel::Month),
            4 => Some(MerkleLevel::Year),
            _ => None,
        }
    }

    /// The tier below, or `None` at the leaves.
    pub fn child(self) -> Option<MerkleLevel> {
        match self {
            MerkleLevel::Now => None,
            MerkleLevel::Hour => Some(MerkleLevel::Now),
            MerkleLevel::Day => Some(MerkleLevel::Hour),
            MerkleLevel::Month => Some(MerkleLevel::Day),
            MerkleLevel::Year => Some(MerkleLevel::Month),
        }
    }

    /// The bucket containing `ts` at this level: `(start, next_start)`.
    pub fn bucket(self, ts: Timestamp) -> (Timestamp, Timestamp) {
        match self {
            MerkleLevel::Now => (ts, ts.next_tick()),
            MerkleLevel::Hour => ts.hour_bucket(),
            MerkleLevel::Day => ts.day_bucket(),
            MerkleLevel::Month => ts.month_bucket(),
            MerkleLevel::Year => ts.year_bucket(),
        }
    }
}

/// One node of the index, as exchanged during anti-entropy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: MerkleLevel,
    pub addr: LogHash,
    /// Bucket start at this level; the oplog `update_ts` at `Now`.
    pub ts: Timestamp,
    pub n_children: u32,
}

/// A leaf key: enough to fetch or request the oplog it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MerkleKey {
    pub ts: Timestamp,
    pub addr: LogHash,
}

/// The index itself: a view over the family's region of the store.
#[derive(Debug, Clone)]
pub struct MerkleIndex {
    keys: FamilyKeys,
    store: Arc<dyn StorageAdapter>,
}

impl MerkleIndex {
    pub fn new(keys: FamilyKeys, store: Arc<dyn StorageAdapter>) -> Self {
        MerkleIndex { keys, store }
    }

    /// Records leaf nodes for freshly saved oplogs.
    ///
    /// Upper tiers are not touched here; [`MerkleIndex::generate`] folds the
    /// dirty range in one pass later.
    pub fn add(&self, oplogs: &[Oplog]) -> Result<()> {
        if oplogs.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(oplogs.len());
        let mut min_ts = Timestamp::new(u64::MAX, 0);
        for oplog in oplogs {
            let node = MerkleNode {
                level: MerkleLevel::Now,
                addr: oplog.hash,
                ts: oplog.update_ts,
                n_children: 0,
            };
            let key = self
                .keys
                .merkle(MerkleLevel::Now, oplog.update_ts, &oplog.hash);
            ops.push(BatchOp::Put(key, encode_node(&node)?));
            min_ts = min_ts.min(oplog.update_ts);
        }
        self.store.batch(ops)?;
        self.mark_dirty(min_ts)
    }

    /// Drops leaf nodes, e.g. when expired oplogs are purged.
    pub fn remove(&self, leaves: &[MerkleKey]) -> Result<()> {
        if leaves.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(leaves.len());
        let mut min_ts = Timestamp::new(u64::MAX, 0);
        for leaf in leaves {
            ops.push(BatchOp::Delete(self.keys.merkle(
                MerkleLevel::Now,
                leaf.ts,
                &leaf.addr,
            )));
            min_ts = min_ts.min(leaf.ts);
        }
        self.store.batch(ops)?;
        self.mark_dirty(min_ts)
    }

    /// Folds every dirty bucket upward and advances the generate watermark.
    pub fn generate(&self, now: Timestamp) -> Result<()> {
        if let Some(dirty) = self.meta_ts(META_DIRTY)? {
            for level in [
                MerkleLevel::Hour,
                MerkleLevel::Day,
                MerkleLevel::Month,
                MerkleLevel::Year,
            ] {
                self.regen_level(level, dirty, now)?;
            }
            self.store.delete(&self.keys.merkle_meta(META_DIRTY))?;
        }
        self.set_meta_ts(META_GENERATE, now)
    }

    /// All nodes of one level, bucket order. The year tier is the summary
    /// exchanged first during anti-entropy. With `since`, only the buckets
    /// covering `since` or later; the containing bucket is included.
    pub fn level_nodes(
        &self,
        level: MerkleLevel,
        since: Option<Timestamp>,
    ) -> Result<Vec<MerkleNode>> {
        let pairs =
            self.store
                .iter(&self.keys.merkle_level_prefix(level), None, IterDir::Forward)?;
        let bound = since.map(|ts| level.bucket(ts).0);
        pairs
            .iter()
            .map(|(_, v)| decode_node(v))
            .filter(|node| match (node, bound) {
                (Ok(node), Some(bound)) => node.ts >= bound,
                _ => true,
            })
            .collect()
    }

    /// Child nodes of the bucket starting at `bucket_ts` on `level`.
    pub fn children_of(&self, level: MerkleLevel, bucket_ts: Timestamp) -> Result<Vec<MerkleNode>> {
        let Some(child) = level.child() else {
            return Ok(Vec::new());
        };
        let (start, next) = level.bucket(bucket_ts);
        self.nodes_in_range(child, start, next)
    }

    /// Sorted leaf keys inside the hour starting at `bucket_ts`.
    pub fn leaf_keys(&self, bucket_ts: Timestamp) -> Result<Vec<MerkleKey>> {
        let (start, next) = MerkleLevel::Hour.bucket(bucket_ts);
        let nodes = self.nodes_in_range(MerkleLevel::Now, start, next)?;
        let mut keys: Vec<MerkleKey> = nodes
            .into_iter()
            .map(|n| MerkleKey {
                ts: n.ts,
                addr: n.addr,
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Recomputes every upper-tier node from the leaves and compares it to
    /// the stored one. A mismatch is [`Error::Corrupted`].
    pub fn validate(&self) -> Result<()> {
        for level in [
            MerkleLevel::Hour,
            MerkleLevel::Day,
            MerkleLevel::Month,
            MerkleLevel::Year,
        ] {
            let child = match level.child() {
                Some(child) => child,
                None => continue,
            };
            for node in self.level_nodes(level, None)? {
                let (start, next) = level.bucket(node.ts);
                let children = self.nodes_in_range(child, start, next)?;
                let (addr, n) = fold_children(&children);
                if addr != node.addr || n != node.n_children {
                    warn!(
                        level = ?level,
                        bucket = %node.ts,
                        "merkle node does not match its children"
                    );
                    return Err(Error::Corrupted);
                }
            }
        }
        Ok(())
    }

    /// Discards every upper tier and regenerates it from the leaves.
    pub fn rebuild(&self, now: Timestamp) -> Result<()> {
        debug!("rebuilding merkle index");
        let mut ops = Vec::new();
        for level in [
            MerkleLevel::Hour,
            MerkleLevel::Day,
            MerkleLevel::Month,
            MerkleLevel::Year,
        ] {
            for (key, _) in
                self.store
                    .iter(&self.keys.merkle_level_prefix(level), None, IterDir::Forward)?
            {
                ops.push(BatchOp::Delete(key));
            }
        }
        self.store.batch(ops)?;
        let leaves = self
            .store
            .iter(&self.keys.merkle_level_prefix(MerkleLevel::Now), None, IterDir::Forward)?;
        let earliest = match leaves.first() {
            Some((_, v)) => decode_node(v)?.ts,
            None => now,
        };
        self.mark_dirty(earliest)?;
        self.generate(now)
    }

    pub fn generate_ts(&self) -> Result<Option<Timestamp>> {
        self.meta_ts(META_GENERATE)
    }

    pub fn sync_ts(&self) -> Result<Option<Timestamp>> {
        self.meta_ts(META_SYNC)
    }

    pub fn set_sync_ts(&self, ts: Timestamp) -> Result<()> {
        self.set_meta_ts(META_SYNC, ts)
    }

    pub fn fail_sync_ts(&self) -> Result<Option<Timestamp>> {
        self.meta_ts(META_FAIL_SYNC)
    }

    pub fn set_fail_sync_ts(&self, ts: Timestamp) -> Result<()> {
        self.set_meta_ts(META_FAIL_SYNC, ts)
    }

    fn regen_level(&self, level: MerkleLevel, from: Timestamp, until: Timestamp) -> Result<()> {
        let child = match level.child() {
            Some(child) => child,
            None => return Ok(()),
        };
        let mut ops = Vec::new();
        let (mut start, mut next) = level.bucket(from);
        loop {
            let children = self.nodes_in_range(child, start, next)?;
            let key = self.keys.merkle(level, start, &ZERO_HASH);
            // One node per bucket; addressed by bucket start alone.
            let stored = self
                .store
                .iter(&self.keys.merkle_level_ts_prefix(level, start), None, IterDir::Forward)?;
            for (old_key, _) in &stored {
                if *old_key != key {
                    ops.push(BatchOp::Delete(old_key.clone()));
                }
            }
            if children.is_empty() {
                ops.push(BatchOp::Delete(key));
            } else {
                let (addr, n_children) = fold_children(&children);
                let node = MerkleNode {
                    level,
                    addr,
                    ts: start,
                    n_children,
                };
                ops.push(BatchOp::Put(key, encode_node(&node)?));
            }
            if until < next {
                break;
            }
            let (s, n) = level.bucket(next);
            (start, next) = (s, n);
        }
        self.store.batch(ops)
    }

    fn nodes_in_range(
        &self,
        level: MerkleLevel,
        start: Timestamp,
        next: Timestamp,
    ) -> Result<Vec<MerkleNode>> {
        let prefix = self.keys.merkle_level_prefix(level);
        let lower = self.keys.merkle_level_ts_prefix(level, start);
        let pairs = self.store.iter(&prefix, Some(&lower), IterDir::Forward)?;
        let mut out = Vec::with_capacity(pairs.len());
        for (_, v) in pairs {
            let node = decode_node(&v)?;
            if node.ts >= next {
                break;
            }
            out.push(node);
        }
        Ok(out)
    }

    fn mark_dirty(&self, ts: Timestamp) -> Result<()> {
        let dirty = match self.meta_ts(META_DIRTY)? {
            Some(prev) => prev.min(ts),
            None => ts,
        };
        self.set_meta_ts(META_DIRTY, dirty)
    }

    fn meta_ts(&self, name: &[u8]) -> Result<Option<Timestamp>> {
        Ok(self
            .store
            .get(&self.keys.merkle_meta(name))?
            .and_then(|raw| Timestamp::from_bytes(&raw)))
    }

    fn set_meta_ts(&self, name: &[u8], ts: Timestamp) -> Result<()> {
        self.store.put(&self.keys.merkle_meta(name), &ts.to_bytes())
    }
}

/// Address and child count of a parent over `children` (sorted by address).
fn fold_children(children: &[MerkleNode]) -> (LogHash, u32) {
    let mut addrs: Vec<&LogHash> = children.iter().map(|n| &n.addr).collect();
    addrs.sort();
    let mut hasher = blake3::Hasher::new();
    for addr in addrs {
        hasher.update(addr);
    }
    (*hasher.finalize().as_bytes(), children.len() as u32)
}

/// Splits two sorted leaf-key lists into `(only_mine, only_theirs)`.
pub fn merge_keys(mine: &[MerkleKey], theirs: &[MerkleKey]) -> (Vec<MerkleKey>, Vec<MerkleKey>) {
    let mut only_mine = Vec::new();
    let mut only_theirs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < mine.len() && j < theirs.len() {
        match mine[i].cmp(&theirs[j]) {
            std::cmp::Ordering::Less => {
                only_mine.push(mine[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                only_theirs.push(theirs[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    only_mine.extend_from_slice(&mine[i..]);
    only_theirs.extend_from_slice(&theirs[j..]);
    (only_mine, only_theirs)
}

fn encode_node(node: &MerkleNode) -> Result<Vec<u8>> {
    postcard::to_stdvec(node).map_err(|_| Error::Db("merkle node encode failed".into()))
}

fn decode_node(raw: &[u8]) -> Result<MerkleNode> {
    postcard::from_bytes(raw).map_err(|_| Error::Corrupted)
}
