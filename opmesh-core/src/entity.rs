//! Entities: the replication domains oplog families live inside.
//!
//! An entity carries the membership view that ratification decisions need:
//! who the masters are, who the members are, and how big the quorum is.
//! Membership itself changes through oplogs like everything else; this
//! module only holds the materialised view.

use std::collections::{BTreeMap, BTreeSet};

use opmesh_base::{Id, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::ObjectStatus;

/// A node entitled to co-sign oplogs toward the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    pub id: Id,
    pub joined_ts: Timestamp,
    pub status: ObjectStatus,
}

/// A node entitled to read and propose within the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Id,
    pub joined_ts: Timestamp,
    pub status: ObjectStatus,
}

/// The materialised membership view of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: Id,
    pub creator_id: Id,
    pub create_ts: Timestamp,
    pub status: ObjectStatus,
    /// Ids allowed to change membership.
    pub owners: BTreeSet<Id>,
    pub masters: BTreeMap<Id, Master>,
    pub members: BTreeMap<Id, Member>,
}

impl Entity {
    /// A fresh entity whose creator is sole owner, master and member.
    pub fn new(entity_id: Id, creator_id: Id, create_ts: Timestamp) -> Self {
        let mut entity = Entity {
            entity_id,
            creator_id,
            create_ts,
            status: ObjectStatus::Alive,
            owners: BTreeSet::new(),
            masters: BTreeMap::new(),
            members: BTreeMap::new(),
        };
        entity.owners.insert(creator_id);
        entity.add_master(creator_id, create_ts);
        entity.add_member(creator_id, create_ts);
        entity
    }

    pub fn add_master(&mut self, id: Id, ts: Timestamp) {
        self.masters.insert(
            id,
            Master {
                id,
                joined_ts: ts,
                status: ObjectStatus::Alive,
            },
        );
    }

    pub fn remove_master(&mut self, id: &Id) {
        self.masters.remove(id);
    }

    pub fn add_member(&mut self, id: Id, ts: Timestamp) {
        self.members.insert(
            id,
            Member {
                id,
                joined_ts: ts,
                status: ObjectStatus::Alive,
            },
        );
    }

    pub fn remove_member(&mut self, id: &Id) {
        self.members.remove(id);
        self.masters.remove(id);
    }

    pub fn is_master(&self, id: &Id) -> bool {
        self.masters
            .get(id)
            .is_some_and(|m| m.status == ObjectStatus::Alive)
    }

    pub fn is_member(&self, id: &Id) -> bool {
        self.members
            .get(id)
            .is_some_and(|m| m.status == ObjectStatus::Alive)
    }

    /// Ids of the live masters.
    pub fn master_ids(&self) -> impl Iterator<Item = &Id> {
        self.masters
            .values()
            .filter(|m| m.status == ObjectStatus::Alive)
            .map(|m| &m.id)
    }

    fn n_live_masters(&self) -> usize {
        self.master_ids().count()
    }

    /// Signatures required for ratification: strictly more than two thirds
    /// of the live masters.
    pub fn master_quorum(&self) -> usize {
        let n = self.n_live_masters();
        (2 * n + 2) / 3
    }

    /// Whether `id` alone ratifies, i.e. it is the only live master.
    pub fn is_sole_master(&self, id: &Id) -> bool {
        self.n_live_masters() == 1 && self.is_master(id)
    }

    /// Fails unless `id` is a live master.
    pub fn require_master(&self, id: &Id) -> Result<()> {
        if self.is_master(id) {
            Ok(())
        } else {
            Err(Error::NotMaster)
        }
    }

    /// Fails unless `id` is a live member.
    pub fn require_member(&self, id: &Id) -> Result<()> {
        if self.is_member(id) {
            Ok(())
        } else {
            Err(Error::NotMember)
        }
    }
}
