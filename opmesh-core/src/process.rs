//! Side-effect accumulator for a batch of applied oplogs.
//!
//! Handlers never talk to peers directly; they record what must happen next
//! in a [`ProcessInfo`] and the post-process step turns it into fetches,
//! force-syncs and broadcasts.

use std::collections::{BTreeMap, BTreeSet};

use opmesh_base::Id;

use crate::oplog::Oplog;

/// What a batch of handled oplogs left behind.
#[derive(Debug, Default, Clone)]
pub struct ProcessInfo {
    /// Objects created whose payload must still be fetched: obj id to the
    /// oplog that created it.
    pub create_obj: BTreeMap<Id, Id>,
    /// Objects with a pending update whose payload must still be fetched.
    pub update_obj: BTreeMap<Id, Id>,
    /// Objects entering the deletion path.
    pub delete_obj: BTreeMap<Id, Id>,
    /// Oplogs received ahead of a chain gap; the doer's history must be
    /// pulled by merkle comparison.
    pub force_sync: BTreeSet<Id>,
    /// Records to announce to fit peers once the batch commits.
    pub broadcast: Vec<Oplog>,
    /// Records dropped by validation; counts against the sending peer.
    pub rejected: usize,
}

impl ProcessInfo {
    /// No follow-up work. Rejections are a counter, not pending work.
    pub fn is_empty(&self) -> bool {
        self.create_obj.is_empty()
            && self.update_obj.is_empty()
            && self.delete_obj.is_empty()
            && self.force_sync.is_empty()
            && self.broadcast.is_empty()
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: ProcessInfo) {
        self.create_obj.extend(other.create_obj);
        self.update_obj.extend(other.update_obj);
        self.delete_obj.extend(other.delete_obj);
        self.force_sync.extend(other.force_sync);
        self.broadcast.extend(other.broadcast);
        self.rejected += other.rejected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opmesh_base::SecretKey;
    use rand_core::SeedableRng;

    #[test]
    fn test_merge() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(1);
        let a = SecretKey::generate(&mut rng).id();
        let b = SecretKey::generate(&mut rng).id();

        let mut left = ProcessInfo::default();
        left.create_obj.insert(a, b);
        let mut right = ProcessInfo::default();
        right.force_sync.insert(a);

        assert!(!left.is_empty());
        left.merge(right);
        assert_eq!(left.create_obj.len(), 1);
        assert!(left.force_sync.contains(&a));
        assert!(ProcessInfo::default().is_empty());
    }
}
