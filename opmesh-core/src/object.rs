//! Objects: materialised application state produced by applying oplogs.
//!
//! The core treats object payloads as opaque bytes; an [`ObjectKind`]
//! implementation decides what they mean. All lifecycle transitions are
//! driven by oplogs, never by direct mutation.

use bytes::Bytes;
use opmesh_base::{Id, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oplog::{Op, Oplog};

/// Lifecycle status of an object.
///
/// The variant order is the lifecycle order; `PartialOrd` comparisons are
/// used when deciding whether a status may progress. Every status from
/// `Failed` onward is absorbing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ObjectStatus {
    #[default]
    Init,
    InternalSync,
    InternalPending,
    Pending,
    Alive,
    Failed,
    MigrateForbidden,
    InternalTerminal,
    Terminal,
    InternalDeleted,
    PendingDeleted,
    Deleted,
    Migrated,
}

impl ObjectStatus {
    /// Statuses that can never be left again.
    pub fn is_absorbing(self) -> bool {
        self >= ObjectStatus::Failed
    }

    /// Whether the object is visible live state.
    pub fn is_alive(self) -> bool {
        self == ObjectStatus::Alive
    }

    /// Whether the object is on the deletion path or gone.
    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            ObjectStatus::InternalDeleted | ObjectStatus::PendingDeleted | ObjectStatus::Deleted
        )
    }
}

/// A proposed but not-yet-ratified object mutation.
///
/// Attached to the live object while the quorum decides; the proposed data
/// does not replace object state until the proposing oplog goes alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// The oplog that proposed this mutation.
    pub log_id: Id,
    pub updater_id: Id,
    pub update_ts: Timestamp,
    pub status: ObjectStatus,
    /// Proposed payload bytes; empty for deletes.
    pub data: Bytes,
    pub is_delete: bool,
}

/// The replicated metadata common to every object kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: Id,
    pub entity_id: Id,
    pub creator_id: Id,
    pub updater_id: Id,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    pub status: ObjectStatus,
    /// Oplog that created the object.
    pub log_id: Option<Id>,
    /// Oplog of the last applied mutation; the idempotence anchor.
    pub update_log_id: Option<Id>,
    /// Pending mutation, if any.
    pub sync_info: Option<SyncInfo>,
}

/// An object: replicated metadata plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub meta: ObjectMeta,
    pub data: Bytes,
}

impl ObjectRecord {
    /// Builds the object an incoming or local create-oplog describes,
    /// in `Init` status.
    pub fn from_create_oplog(entity_id: Id, oplog: &Oplog) -> Self {
        ObjectRecord {
            meta: ObjectMeta {
                id: oplog.obj_id,
                entity_id,
                creator_id: oplog.doer_id,
                updater_id: oplog.doer_id,
                create_ts: oplog.ts,
                update_ts: oplog.ts,
                status: ObjectStatus::Init,
                log_id: Some(oplog.id),
                update_log_id: Some(oplog.id),
                sync_info: None,
            },
            data: oplog.op_data.clone(),
        }
    }
}

/// Capabilities the core needs from one object kind.
///
/// A kind names its verbs and validates its payloads; the generic lifecycle
/// engine does everything else. The hooks mirror the registration table of
/// the protocol manager: `post_create` runs after a create commits,
/// `merge_update` lets a kind fold a proposal into existing bytes.
pub trait ObjectKind: Send + Sync + std::fmt::Debug + 'static {
    /// Stable name, used in logs and as part of the db layout.
    fn name(&self) -> &'static str;

    /// Key-layout component separating this kind's objects from others in
    /// the same family.
    fn db_suffix(&self) -> &'static [u8];

    fn create_op(&self) -> Op;
    fn update_op(&self) -> Op;
    fn delete_op(&self) -> Op;

    /// Validates payload bytes before they are accepted.
    fn validate_data(&self, data: &[u8]) -> Result<()>;

    /// Hook run after a create commits. Default: nothing.
    fn post_create(&self, _obj: &ObjectRecord) {}

    /// Folds proposed bytes into the current payload. Default: replace.
    fn merge_update(&self, _current: &[u8], proposed: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(proposed))
    }
}

/// The verb an oplog applies to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

/// A simple kind whose payload is a non-empty opaque byte string.
///
/// Instantiations register real kinds (user name, user image, board title);
/// this one exists for the core's own tests and as the smallest example.
#[derive(Debug, Clone)]
pub struct BytesKind {
    pub name: &'static str,
    pub db_suffix: &'static [u8],
    pub base_op: u16,
    pub max_len: usize,
}

impl BytesKind {
    pub fn new(name: &'static str, db_suffix: &'static [u8], base_op: u16) -> Self {
        BytesKind {
            name,
            db_suffix,
            base_op,
            max_len: 1 << 20,
        }
    }
}

impl ObjectKind for BytesKind {
    fn name(&self) -> &'static str {
        self.name
    }

    fn db_suffix(&self) -> &'static [u8] {
        self.db_suffix
    }

    fn create_op(&self) -> Op {
        Op(self.base_op)
    }

    fn update_op(&self) -> Op {
        Op(self.base_op + 1)
    }

    fn delete_op(&self) -> Op {
        Op(self.base_op + 2)
    }

    fn validate_data(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > self.max_len {
            return Err(Error::InvalidData);
        }
        Ok(())
    }
}
