//! The per-family protocol manager.
//!
//! One manager owns one oplog family inside one entity: it mints and signs
//! local oplogs, validates and integrates remote ones, drives the object
//! lifecycle through the registered [`ObjectKind`]s, and keeps the merkle
//! index in step with the alive oplog store.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use iroh_metrics::{inc, inc_by};
use opmesh_base::{Clock, Id, SecretKey, Timestamp};
use parking_lot::{Mutex, RwLock};
use rand_core::RngCore;
use tracing::{debug, trace, warn};

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::merkle::{MerkleIndex, MerkleKey};
use crate::metrics::Metrics;
use crate::object::{ObjectKind, ObjectRecord, ObjectStatus, SyncInfo, Verb};
use crate::oplog::{LogHash, Op, Oplog, OplogStatus, EXPIRE_OPLOG_SECS, QUORUM_WAIT_SECS};
use crate::process::ProcessInfo;
use crate::store::{FamilyKeys, IndexEntry, IterDir, StorageAdapter};

const META_HEAD: &[u8] = b"chain-head";

/// Which oplog store a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Alive,
    Pending,
    Internal,
}

/// The state machine for one oplog family.
pub struct ProtocolManager {
    entity_id: Id,
    key: SecretKey,
    keys: FamilyKeys,
    store: Arc<dyn StorageAdapter>,
    merkle: MerkleIndex,
    kinds: BTreeMap<Op, (Arc<dyn ObjectKind>, Verb)>,
    entity: Arc<RwLock<Entity>>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    /// My newest oplog in this family: the hash-chain head.
    head: RwLock<Option<(Id, LogHash)>>,
    /// Serialises object mutations within the family.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolManager")
            .field("entity_id", &self.entity_id.fmt_short())
            .field("me", &self.key.id().fmt_short())
            .finish_non_exhaustive()
    }
}

impl ProtocolManager {
    pub fn new(
        family_prefix: &[u8],
        entity: Arc<RwLock<Entity>>,
        key: SecretKey,
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        let entity_id = entity.read().entity_id;
        let keys = FamilyKeys::new(family_prefix, entity_id);
        let merkle = MerkleIndex::new(keys.clone(), store.clone());
        let head = Self::load_head(&keys, &*store)?;
        Ok(ProtocolManager {
            entity_id,
            key,
            keys,
            store,
            merkle,
            kinds: BTreeMap::new(),
            entity,
            clock,
            rng: Mutex::new(rng),
            head: RwLock::new(head),
            write_lock: Mutex::new(()),
        })
    }

    pub fn entity_id(&self) -> Id {
        self.entity_id
    }

    pub fn my_id(&self) -> Id {
        self.key.id()
    }

    pub fn merkle(&self) -> &MerkleIndex {
        &self.merkle
    }

    pub fn entity(&self) -> &Arc<RwLock<Entity>> {
        &self.entity
    }

    /// The manager's reading of the current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Registers an object kind; its three verbs claim their op codes.
    pub fn register_kind(&mut self, kind: Arc<dyn ObjectKind>) -> Result<()> {
        for (op, verb) in [
            (kind.create_op(), Verb::Create),
            (kind.update_op(), Verb::Update),
            (kind.delete_op(), Verb::Delete),
        ] {
            if self.kinds.contains_key(&op) {
                return Err(Error::AlreadyExists);
            }
            self.kinds.insert(op, (kind.clone(), verb));
        }
        Ok(())
    }

    // ------ local mutations ------

    /// Creates an object of `kind_op`'s kind from `data`.
    ///
    /// When this node is the sole master the record ratifies itself and the
    /// object is immediately alive; otherwise it waits for the quorum.
    pub fn create_object(&self, kind_op: Op, data: Bytes) -> Result<(ObjectRecord, ProcessInfo)> {
        let (kind, verb) = self.kind_for(kind_op)?;
        if verb != Verb::Create {
            return Err(Error::InvalidOp(kind_op.0));
        }
        kind.validate_data(&data)?;

        let _guard = self.write_lock.lock();
        let obj_id = {
            let mut rng = self.rng.lock();
            Id::random(&mut **rng)
        };
        let mut oplog = self.new_oplog(obj_id, kind_op, data)?;
        let status = self.sign_local(&mut oplog)?;

        let mut obj = ObjectRecord::from_create_oplog(self.entity_id, &oplog);
        obj.meta.status = status;
        if status != ObjectStatus::Alive {
            obj.data = Bytes::new();
            obj.meta.sync_info = Some(SyncInfo {
                log_id: oplog.id,
                updater_id: oplog.doer_id,
                update_ts: oplog.ts,
                status,
                data: oplog.op_data.clone(),
                is_delete: false,
            });
        }

        let mut info = ProcessInfo::default();
        self.commit_local(&mut oplog, &mut info)?;
        self.save_object(&obj, false)?;
        if status == ObjectStatus::Alive {
            kind.post_create(&obj);
        }
        debug!(obj = %obj_id.fmt_short(), kind = kind.name(), ?status, "created object");
        Ok((obj, info))
    }

    /// Proposes new payload bytes for an alive object.
    pub fn update_object(&self, kind_op: Op, obj_id: Id, data: Bytes) -> Result<ProcessInfo> {
        let (kind, verb) = self.kind_for(kind_op)?;
        if verb != Verb::Update {
            return Err(Error::InvalidOp(kind_op.0));
        }
        kind.validate_data(&data)?;

        let _guard = self.write_lock.lock();
        let mut obj = self.get_object(obj_id)?.ok_or(Error::NotFound)?;
        if obj.meta.status != ObjectStatus::Alive {
            return Err(Error::InvalidData);
        }
        let mut oplog = self.new_oplog(obj_id, kind_op, data.clone())?;
        let status = self.sign_local(&mut oplog)?;

        if status == ObjectStatus::Alive {
            obj.data = kind.merge_update(&obj.data, &data)?;
            obj.meta.updater_id = oplog.doer_id;
            obj.meta.update_ts = oplog.ts;
            obj.meta.update_log_id = Some(oplog.id);
            obj.meta.sync_info = None;
        } else {
            obj.meta.sync_info = Some(SyncInfo {
                log_id: oplog.id,
                updater_id: oplog.doer_id,
                update_ts: oplog.ts,
                status,
                data,
                is_delete: false,
            });
        }

        let mut info = ProcessInfo::default();
        self.commit_local(&mut oplog, &mut info)?;
        self.save_object(&obj, true)?;
        Ok(info)
    }

    /// Proposes deletion of an alive object.
    pub fn delete_object(&self, kind_op: Op, obj_id: Id) -> Result<ProcessInfo> {
        let (_kind, verb) = self.kind_for(kind_op)?;
        if verb != Verb::Delete {
            return Err(Error::InvalidOp(kind_op.0));
        }

        let _guard = self.write_lock.lock();
        let mut obj = self.get_object(obj_id)?.ok_or(Error::NotFound)?;
        if obj.meta.status != ObjectStatus::Alive {
            return Err(Error::InvalidData);
        }
        let mut oplog = self.new_oplog(obj_id, kind_op, Bytes::new())?;
        let status = self.sign_local(&mut oplog)?;

        match status {
            ObjectStatus::Alive => {
                obj.meta.status = ObjectStatus::Deleted;
                obj.data = Bytes::new();
                obj.meta.updater_id = oplog.doer_id;
                obj.meta.update_ts = oplog.ts;
                obj.meta.update_log_id = Some(oplog.id);
                obj.meta.sync_info = None;
            }
            ObjectStatus::Pending => {
                obj.meta.status = ObjectStatus::PendingDeleted;
                obj.meta.sync_info = Some(SyncInfo {
                    log_id: oplog.id,
                    updater_id: oplog.doer_id,
                    update_ts: oplog.ts,
                    status,
                    data: Bytes::new(),
                    is_delete: true,
                });
            }
            _ => {
                obj.meta.status = ObjectStatus::InternalDeleted;
                obj.meta.sync_info = Some(SyncInfo {
                    log_id: oplog.id,
                    updater_id: oplog.doer_id,
                    update_ts: oplog.ts,
                    status,
                    data: Bytes::new(),
                    is_delete: true,
                });
            }
        }

        let mut info = ProcessInfo::default();
        self.commit_local(&mut oplog, &mut info)?;
        self.save_object(&obj, true)?;
        Ok(info)
    }

    // ------ remote oplogs ------

    /// Integrates a batch of ratified oplogs received from a peer.
    ///
    /// A record that fails validation is dropped with a warning; it never
    /// poisons the rest of the batch.
    pub fn handle_oplogs(&self, oplogs: Vec<Oplog>) -> Result<ProcessInfo> {
        let mut info = ProcessInfo::default();
        for mut oplog in oplogs {
            match self.handle_one(&mut oplog, &mut info) {
                Ok(()) => {}
                Err(Error::ForceSyncRequired(id)) => {
                    info.force_sync.insert(id);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    info.rejected += 1;
                    warn!(oplog = %oplog.id.fmt_short(), %err, "dropping oplog");
                }
            }
        }
        Ok(info)
    }

    /// Integrates not-yet-ratified oplogs. When this node is a master it
    /// co-signs them; a record reaching quorum is ratified on the spot.
    pub fn handle_pending_oplogs(&self, oplogs: Vec<Oplog>) -> Result<ProcessInfo> {
        let mut info = ProcessInfo::default();
        for mut oplog in oplogs {
            match self.handle_one_pending(&mut oplog, &mut info) {
                Ok(()) => {}
                Err(Error::ForceSyncRequired(id)) => {
                    info.force_sync.insert(id);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    info.rejected += 1;
                    warn!(oplog = %oplog.id.fmt_short(), %err, "dropping pending oplog");
                }
            }
        }
        Ok(info)
    }

    fn handle_one(&self, oplog: &mut Oplog, info: &mut ProcessInfo) -> Result<()> {
        oplog.verify()?;
        {
            let entity = self.entity.read();
            entity.require_member(&oplog.doer_id)?;
            if oplog.master_log_id.is_none() {
                // unratified record on the ratified channel
                return self.handle_one_pending(oplog, info);
            }
            oplog.verify_master_signs(entity.master_ids(), entity.master_quorum())?;
        }

        let _guard = self.write_lock.lock();
        let gap = match oplog.prev_id {
            Some(prev) => !self.store.has(&self.keys.oplog_idx(prev))?,
            None => false,
        };
        if gap {
            oplog.is_newer = true;
            self.save_oplog(oplog, Bucket::Alive)?;
            trace!(oplog = %oplog.id.fmt_short(), "chain gap, deferring apply");
            return Err(Error::ForceSyncRequired(oplog.id));
        }
        oplog.is_newer = false;
        let fresh = self.save_oplog(oplog, Bucket::Alive)?;
        if fresh {
            inc!(Metrics, oplogs_remote);
            self.apply(oplog, info)?;
        }
        Ok(())
    }

    fn handle_one_pending(&self, oplog: &mut Oplog, info: &mut ProcessInfo) -> Result<()> {
        oplog.verify()?;
        let now = self.clock.now();
        if oplog.ts < now.saturating_sub_secs(EXPIRE_OPLOG_SECS) {
            return Err(Error::Expired);
        }
        let (i_am_master, quorum) = {
            let entity = self.entity.read();
            entity.require_member(&oplog.doer_id)?;
            (entity.is_master(&self.key.id()), entity.master_quorum())
        };

        let _guard = self.write_lock.lock();
        if i_am_master {
            oplog.master_sign(&self.key, now)?;
        }
        if oplog.quorum_met(quorum) {
            oplog.ratify(oplog.id, now);
            inc!(Metrics, oplogs_ratified);
            drop(_guard);
            // re-enter as ratified; also announce the ratified record
            info.broadcast.push(oplog.clone());
            return self.handle_one(oplog, info);
        }
        oplog.update_ts = now;
        let fresh = self.save_oplog(oplog, Bucket::Pending)?;
        if fresh && i_am_master {
            info.broadcast.push(oplog.clone());
        }
        Ok(())
    }

    fn apply(&self, oplog: &Oplog, info: &mut ProcessInfo) -> Result<()> {
        let Some((kind, verb)) = self.kinds.get(&oplog.op) else {
            return Err(Error::InvalidOp(oplog.op.0));
        };
        match verb {
            Verb::Create => self.apply_create(kind, oplog, info),
            Verb::Update => self.apply_update(kind, oplog, info),
            Verb::Delete => self.apply_delete(oplog, info),
        }
    }

    fn apply_create(
        &self,
        kind: &Arc<dyn ObjectKind>,
        oplog: &Oplog,
        info: &mut ProcessInfo,
    ) -> Result<()> {
        if let Some(existing) = self.get_object(oplog.obj_id)? {
            if existing.meta.log_id == Some(oplog.id) {
                // ours, now ratified
                return self.finish_pending(existing, oplog, kind, info);
            }
            // competing create for the same object id: later (ts, id) wins,
            // the losing record stays in the store and the merkle index
            let existing_key = (existing.meta.create_ts, existing.meta.log_id);
            if (oplog.ts, Some(oplog.id)) <= existing_key {
                trace!(obj = %oplog.obj_id.fmt_short(), "create lost conflict");
                return Ok(());
            }
        }
        let mut obj = ObjectRecord::from_create_oplog(self.entity_id, oplog);
        if oplog.op_data.is_empty() {
            obj.meta.status = ObjectStatus::InternalSync;
            info.create_obj.insert(oplog.obj_id, oplog.id);
        } else {
            kind.validate_data(&oplog.op_data)?;
            obj.meta.status = ObjectStatus::Alive;
        }
        self.save_object(&obj, true)?;
        if obj.meta.status == ObjectStatus::Alive {
            kind.post_create(&obj);
        }
        Ok(())
    }

    fn apply_update(
        &self,
        kind: &Arc<dyn ObjectKind>,
        oplog: &Oplog,
        info: &mut ProcessInfo,
    ) -> Result<()> {
        let Some(mut obj) = self.get_object(oplog.obj_id)? else {
            // update before create: pull the doer's history
            info.force_sync.insert(oplog.id);
            return Ok(());
        };
        if obj.meta.update_log_id == Some(oplog.id) {
            return Ok(());
        }
        if obj
            .meta
            .sync_info
            .as_ref()
            .is_some_and(|s| s.log_id == oplog.id)
        {
            return self.finish_pending(obj, oplog, kind, info);
        }
        if (oplog.ts, Some(oplog.id)) <= (obj.meta.update_ts, obj.meta.update_log_id) {
            trace!(obj = %oplog.obj_id.fmt_short(), "update lost conflict");
            return Ok(());
        }
        if obj.meta.status.is_absorbing() {
            return Ok(());
        }
        if oplog.op_data.is_empty() {
            info.update_obj.insert(oplog.obj_id, oplog.id);
            return Ok(());
        }
        kind.validate_data(&oplog.op_data)?;
        obj.data = kind.merge_update(&obj.data, &oplog.op_data)?;
        obj.meta.updater_id = oplog.doer_id;
        obj.meta.update_ts = oplog.ts;
        obj.meta.update_log_id = Some(oplog.id);
        obj.meta.sync_info = None;
        self.save_object(&obj, true)
    }

    fn apply_delete(&self, oplog: &Oplog, info: &mut ProcessInfo) -> Result<()> {
        let Some(mut obj) = self.get_object(oplog.obj_id)? else {
            return Ok(());
        };
        if obj.meta.update_log_id == Some(oplog.id) || obj.meta.status == ObjectStatus::Deleted {
            return Ok(());
        }
        obj.meta.status = ObjectStatus::Deleted;
        obj.data = Bytes::new();
        obj.meta.updater_id = oplog.doer_id;
        obj.meta.update_ts = oplog.ts;
        obj.meta.update_log_id = Some(oplog.id);
        obj.meta.sync_info = None;
        info.delete_obj.insert(oplog.obj_id, oplog.id);
        self.save_object(&obj, true)
    }

    /// A pending mutation of ours just ratified: promote the proposal.
    fn finish_pending(
        &self,
        mut obj: ObjectRecord,
        oplog: &Oplog,
        kind: &Arc<dyn ObjectKind>,
        info: &mut ProcessInfo,
    ) -> Result<()> {
        let Some(sync) = obj.meta.sync_info.take() else {
            return Ok(());
        };
        if sync.is_delete {
            obj.meta.status = ObjectStatus::Deleted;
            obj.data = Bytes::new();
            info.delete_obj.insert(obj.meta.id, oplog.id);
        } else {
            obj.data = kind.merge_update(&obj.data, &sync.data)?;
            let was_create = obj.meta.log_id == Some(oplog.id);
            obj.meta.status = ObjectStatus::Alive;
            if was_create {
                kind.post_create(&obj);
            }
        }
        obj.meta.updater_id = oplog.doer_id;
        obj.meta.update_ts = oplog.ts;
        obj.meta.update_log_id = Some(oplog.id);
        self.save_object(&obj, true)
    }

    /// Fills in the payload of an object created or updated through an
    /// oplog that carried no data. Returns `true` when state changed.
    pub fn fill_object(&self, theirs: &ObjectRecord) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(mut obj) = self.get_object(theirs.meta.id)? else {
            return Ok(false);
        };
        if obj.meta.status != ObjectStatus::InternalSync {
            return Ok(false);
        }
        if obj.meta.log_id != theirs.meta.log_id {
            return Ok(false);
        }
        let kind = obj
            .meta
            .log_id
            .and_then(|id| self.get_oplog(id).transpose())
            .transpose()?
            .and_then(|oplog| self.kinds.get(&oplog.op).cloned());
        let Some((kind, _)) = kind else {
            return Ok(false);
        };
        kind.validate_data(&theirs.data)?;
        obj.data = theirs.data.clone();
        obj.meta.status = ObjectStatus::Alive;
        obj.meta.update_ts = theirs.meta.update_ts;
        obj.meta.update_log_id = theirs.meta.update_log_id;
        self.save_object(&obj, true)?;
        kind.post_create(&obj);
        Ok(true)
    }

    /// Replaces local object state with a peer's copy when the peer's is
    /// strictly newer. The force-sync repair path.
    pub fn force_set_object(&self, theirs: &ObjectRecord) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if let Some(mine) = self.get_object(theirs.meta.id)? {
            let mine_key = (mine.meta.update_ts, mine.meta.update_log_id);
            let theirs_key = (theirs.meta.update_ts, theirs.meta.update_log_id);
            if theirs_key <= mine_key {
                return Ok(false);
            }
        }
        self.save_object(theirs, true)?;
        Ok(true)
    }

    // ------ maintenance ------

    /// Drops pending and internal records older than the retention horizon.
    pub fn expire_pending(&self, now: Timestamp) -> Result<usize> {
        let horizon = now.saturating_sub_secs(EXPIRE_OPLOG_SECS);
        let mut expired = 0;
        let _guard = self.write_lock.lock();
        for prefix in [
            self.keys.pending_oplog_prefix(),
            self.keys.internal_oplog_prefix(),
        ] {
            for (key, raw) in self.store.iter(&prefix, None, IterDir::Forward)? {
                let oplog: Oplog = match postcard::from_bytes(&raw) {
                    Ok(oplog) => oplog,
                    Err(_) => continue,
                };
                if oplog.ts < horizon {
                    self.store.delete_all(&self.keys.oplog_idx(oplog.id))?;
                    self.store.delete(&key)?;
                    expired += 1;
                    // a pending create that expires takes its placeholder with it
                    if let Some(obj) = self.get_object(oplog.obj_id)? {
                        if obj.meta.log_id == Some(oplog.id)
                            && obj.meta.status < ObjectStatus::Alive
                        {
                            self.store
                                .delete_all(&self.keys.object_idx(oplog.obj_id))?;
                        }
                    }
                }
            }
        }
        if expired > 0 {
            inc_by!(Metrics, oplogs_expired, expired as u64);
            debug!(expired, "expired pending oplogs");
        }
        Ok(expired)
    }

    /// Pending records past the quorum wait. They stay in the store for
    /// retry; callers surface the wait.
    pub fn quorum_stalled(&self, now: Timestamp) -> Result<Vec<Oplog>> {
        let deadline = now.saturating_sub_secs(QUORUM_WAIT_SECS);
        Ok(self
            .pending_oplogs()?
            .into_iter()
            .filter(|oplog| oplog.ts < deadline)
            .collect())
    }

    // ------ reads ------

    pub fn get_object(&self, obj_id: Id) -> Result<Option<ObjectRecord>> {
        match self.store.get(&self.keys.object(obj_id))? {
            Some(raw) => Ok(Some(
                postcard::from_bytes(&raw).map_err(|_| Error::Db("bad object record".into()))?,
            )),
            None => Ok(None),
        }
    }

    /// Objects of this family, id order.
    pub fn objects(&self) -> Result<Vec<ObjectRecord>> {
        let pairs = self
            .store
            .iter(&self.keys.object_prefix(), None, IterDir::Forward)?;
        pairs
            .iter()
            .map(|(_, raw)| {
                postcard::from_bytes(raw).map_err(|_| Error::Db("bad object record".into()))
            })
            .collect()
    }

    pub fn get_oplog(&self, id: Id) -> Result<Option<Oplog>> {
        let Some(raw) = self.store.get(&self.keys.oplog_idx(id))? else {
            return Ok(None);
        };
        let idx: IndexEntry =
            postcard::from_bytes(&raw).map_err(|_| Error::Db("bad index entry".into()))?;
        let Some(key) = idx.keys.first() else {
            return Ok(None);
        };
        match self.store.get(key)? {
            Some(raw) => Ok(Some(
                postcard::from_bytes(&raw).map_err(|_| Error::Db("bad oplog record".into()))?,
            )),
            None => Ok(None),
        }
    }

    /// Alive oplogs with `update_ts >= from`, time order, up to `limit`.
    pub fn oplogs_after(&self, from: Timestamp, limit: usize) -> Result<Vec<Oplog>> {
        let prefix = self.keys.oplog_prefix();
        let start = self.keys.oplog_ts_prefix(from);
        let pairs = self.store.iter(&prefix, Some(&start), IterDir::Forward)?;
        pairs
            .iter()
            .take(limit)
            .map(|(_, raw)| {
                postcard::from_bytes(raw).map_err(|_| Error::Db("bad oplog record".into()))
            })
            .collect()
    }

    /// Alive oplogs matching merkle leaf keys.
    pub fn oplogs_by_keys(&self, keys: &[MerkleKey]) -> Result<Vec<Oplog>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // leaf keys address by (ts, hash); scan the tick
            let prefix = self.keys.oplog_ts_prefix(key.ts);
            for (_, raw) in self.store.iter(&prefix, None, IterDir::Forward)? {
                let oplog: Oplog =
                    postcard::from_bytes(&raw).map_err(|_| Error::Db("bad oplog record".into()))?;
                if oplog.hash == key.addr {
                    out.push(oplog);
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Every pending oplog, time order.
    pub fn pending_oplogs(&self) -> Result<Vec<Oplog>> {
        let pairs =
            self.store
                .iter(&self.keys.pending_oplog_prefix(), None, IterDir::Forward)?;
        pairs
            .iter()
            .map(|(_, raw)| {
                postcard::from_bytes(raw).map_err(|_| Error::Db("bad oplog record".into()))
            })
            .collect()
    }

    // ------ internals ------

    fn kind_for(&self, op: Op) -> Result<(Arc<dyn ObjectKind>, Verb)> {
        self.kinds
            .get(&op)
            .cloned()
            .ok_or(Error::InvalidOp(op.0))
    }

    fn new_oplog(&self, obj_id: Id, op: Op, data: Bytes) -> Result<Oplog> {
        let ts = self.clock.now();
        let prev = *self.head.read();
        let mut rng = self.rng.lock();
        Oplog::new(&self.key, obj_id, ts, op, data, prev, &mut **rng)
    }

    /// Signs a local record according to this node's role in the entity.
    fn sign_local(&self, oplog: &mut Oplog) -> Result<ObjectStatus> {
        let entity = self.entity.read();
        let me = self.key.id();
        entity.require_member(&me)?;
        if entity.is_sole_master(&me) {
            oplog.master_sign(&self.key, oplog.ts)?;
            oplog.ratify(oplog.id, oplog.ts);
            Ok(ObjectStatus::Alive)
        } else if entity.is_master(&me) {
            oplog.master_sign(&self.key, oplog.ts)?;
            Ok(ObjectStatus::Pending)
        } else {
            oplog.internal_sign(&self.key, oplog.ts)?;
            Ok(ObjectStatus::InternalPending)
        }
    }

    /// Persists a freshly minted local record and advances the chain head.
    fn commit_local(&self, oplog: &mut Oplog, info: &mut ProcessInfo) -> Result<()> {
        let bucket = match oplog.status() {
            OplogStatus::Alive => Bucket::Alive,
            OplogStatus::Pending => Bucket::Pending,
            _ => Bucket::Internal,
        };
        self.save_oplog(oplog, bucket)?;
        self.set_head(oplog.id, oplog.hash)?;
        inc!(Metrics, oplogs_local);
        // internal signs are stripped by serialization; a single-device node
        // promotes its internal record to the masters right away
        info.broadcast.push(oplog.clone());
        Ok(())
    }

    /// Saves a record, merging with any stored copy of the same id.
    ///
    /// Returns `true` when the write changed stored state.
    fn save_oplog(&self, oplog: &mut Oplog, bucket: Bucket) -> Result<bool> {
        let idx_key = self.keys.oplog_idx(oplog.id);
        let mut stale_leaf = None;
        if let Some(raw) = self.store.get(&idx_key)? {
            let idx: IndexEntry =
                postcard::from_bytes(&raw).map_err(|_| Error::Db("bad index entry".into()))?;
            if let Some(stored) = idx
                .keys
                .first()
                .and_then(|key| self.store.get(key).transpose())
                .transpose()?
            {
                let stored: Oplog = postcard::from_bytes(&stored)
                    .map_err(|_| Error::Db("bad oplog record".into()))?;
                let was_alive = idx
                    .keys
                    .first()
                    .is_some_and(|key| key.starts_with(&self.keys.oplog_prefix()));
                if oplog.hash == stored.hash {
                    let grew = oplog.integrate_existing(&stored)?;
                    // a stored copy deferred behind a chain gap must be
                    // rewritten and re-applied once the gap fills
                    if !grew && !stored.is_newer && (bucket != Bucket::Alive || was_alive) {
                        return Ok(false);
                    }
                } else if !oplog.select_existing(&stored) {
                    return Ok(false);
                }
                if was_alive && (stored.update_ts != oplog.update_ts || stored.hash != oplog.hash)
                {
                    stale_leaf = Some(MerkleKey {
                        ts: stored.update_ts,
                        addr: stored.hash,
                    });
                }
            }
        }
        let key = match bucket {
            Bucket::Alive => self.keys.oplog(oplog.update_ts, oplog.id),
            Bucket::Pending => self.keys.pending_oplog(oplog.update_ts, oplog.id),
            Bucket::Internal => self.keys.internal_oplog(oplog.update_ts, oplog.id),
        };
        let idx = IndexEntry {
            keys: vec![key.clone()],
            update_ts: oplog.update_ts,
        };
        let raw =
            postcard::to_stdvec(oplog).map_err(|_| Error::Db("oplog encode failed".into()))?;
        self.store
            .try_put_all(&idx_key, &idx, vec![(key, raw)], true, false)?;
        if let Some(leaf) = stale_leaf {
            self.merkle.remove(&[leaf])?;
        }
        // a record deferred behind a chain gap stays out of the merkle
        // index until applied, so peers keep offering it during sync
        if bucket == Bucket::Alive && !oplog.is_newer {
            self.merkle.add(std::slice::from_ref(oplog))?;
        }
        Ok(true)
    }

    fn save_object(&self, obj: &ObjectRecord, allow_overwrite: bool) -> Result<()> {
        let idx_key = self.keys.object_idx(obj.meta.id);
        let key = self.keys.object(obj.meta.id);
        let idx = IndexEntry {
            keys: vec![key.clone()],
            update_ts: obj.meta.update_ts,
        };
        let raw =
            postcard::to_stdvec(obj).map_err(|_| Error::Db("object encode failed".into()))?;
        self.store
            .try_put_all(&idx_key, &idx, vec![(key, raw)], allow_overwrite, false)?;
        Ok(())
    }

    fn load_head(keys: &FamilyKeys, store: &dyn StorageAdapter) -> Result<Option<(Id, LogHash)>> {
        let Some(raw) = store.get(&keys.meta(META_HEAD))? else {
            return Ok(None);
        };
        if raw.len() != Id::LEN + 32 {
            return Err(Error::Db("bad chain head".into()));
        }
        let id = Id::from_slice(&raw[..Id::LEN]).ok_or(Error::Db("bad chain head".into()))?;
        let hash: LogHash = raw[Id::LEN..]
            .try_into()
            .map_err(|_| Error::Db("bad chain head".into()))?;
        Ok(Some((id, hash)))
    }

    fn set_head(&self, id: Id, hash: LogHash) -> Result<()> {
        let mut raw = Vec::with_capacity(Id::LEN + 32);
        raw.extend_from_slice(id.as_bytes());
        raw.extend_from_slice(&hash);
        self.store.put(&self.keys.meta(META_HEAD), &raw)?;
        *self.head.write() = Some((id, hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BytesKind;
    use crate::store::MemStore;
    use opmesh_base::SystemClock;
    use rand_core::SeedableRng;

    #[derive(Debug)]
    struct FixedClock(parking_lot::Mutex<Timestamp>);

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            let mut ts = self.0.lock();
            *ts = ts.next_tick();
            *ts
        }
    }

    fn fixed_clock(secs: u64) -> Arc<FixedClock> {
        Arc::new(FixedClock(parking_lot::Mutex::new(Timestamp::new(
            secs, 0,
        ))))
    }

    fn manager_with(
        key: SecretKey,
        entity: Arc<RwLock<Entity>>,
        store: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> ProtocolManager {
        let rng = Box::new(rand_chacha::ChaCha12Rng::seed_from_u64(seed));
        let mut mgr =
            ProtocolManager::new(b"tst", entity, key, store, clock, rng).unwrap();
        mgr.register_kind(Arc::new(BytesKind::new("note", b"nt", 0x10)))
            .unwrap();
        mgr
    }

    fn solo_manager(seed: u64) -> ProtocolManager {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(seed);
        let key = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let entity = Arc::new(RwLock::new(Entity::new(
            entity_id,
            key.id(),
            Timestamp::new(1, 0),
        )));
        manager_with(
            key,
            entity,
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            seed,
        )
    }

    #[test]
    fn test_sole_master_create_is_alive() {
        let mgr = solo_manager(1);
        let (obj, info) = mgr
            .create_object(Op(0x10), Bytes::from_static(b"hello"))
            .unwrap();
        assert_eq!(obj.meta.status, ObjectStatus::Alive);
        assert_eq!(info.broadcast.len(), 1);
        assert_eq!(info.broadcast[0].status(), OplogStatus::Alive);

        let stored = mgr.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"hello"));
        let oplog = mgr.get_oplog(info.broadcast[0].id).unwrap().unwrap();
        assert_eq!(oplog.obj_id, obj.meta.id);
    }

    #[test]
    fn test_update_and_delete_lifecycle() {
        let mgr = solo_manager(2);
        let (obj, _) = mgr
            .create_object(Op(0x10), Bytes::from_static(b"v1"))
            .unwrap();
        mgr.update_object(Op(0x11), obj.meta.id, Bytes::from_static(b"v2"))
            .unwrap();
        let stored = mgr.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(stored.data, Bytes::from_static(b"v2"));
        assert_eq!(stored.meta.status, ObjectStatus::Alive);

        mgr.delete_object(Op(0x12), obj.meta.id).unwrap();
        let stored = mgr.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(stored.meta.status, ObjectStatus::Deleted);
        assert!(stored.data.is_empty());

        // mutating a deleted object is refused
        assert!(mgr
            .update_object(Op(0x11), obj.meta.id, Bytes::from_static(b"v3"))
            .is_err());
    }

    #[test]
    fn test_local_oplogs_form_a_chain() {
        let mgr = solo_manager(3);
        let (_, info1) = mgr
            .create_object(Op(0x10), Bytes::from_static(b"a"))
            .unwrap();
        let (_, info2) = mgr
            .create_object(Op(0x10), Bytes::from_static(b"b"))
            .unwrap();
        let first = &info1.broadcast[0];
        let second = &info2.broadcast[0];
        assert_eq!(second.prev_id, Some(first.id));
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn test_remote_oplogs_converge() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(4);
        let key_a = SecretKey::generate(&mut rng);
        let key_b = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        // a is sole master, b is a member
        let mut entity = Entity::new(entity_id, key_a.id(), Timestamp::new(1, 0));
        entity.add_member(key_b.id(), Timestamp::new(1, 0));

        let mgr_a = manager_with(
            key_a,
            Arc::new(RwLock::new(entity.clone())),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            4,
        );
        let mgr_b = manager_with(
            key_b,
            Arc::new(RwLock::new(entity)),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            5,
        );

        let (obj, info) = mgr_a
            .create_object(Op(0x10), Bytes::from_static(b"shared"))
            .unwrap();
        let info_b = mgr_b.handle_oplogs(info.broadcast).unwrap();
        assert!(info_b.force_sync.is_empty());

        let replica = mgr_b.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(replica.data, Bytes::from_static(b"shared"));
        assert_eq!(replica.meta.status, ObjectStatus::Alive);
    }

    #[test]
    fn test_handling_is_idempotent_and_commutative() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(6);
        let key_a = SecretKey::generate(&mut rng);
        let key_b = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let mut entity = Entity::new(entity_id, key_a.id(), Timestamp::new(1, 0));
        entity.add_member(key_b.id(), Timestamp::new(1, 0));
        let entity = Arc::new(RwLock::new(entity));

        let mgr_a = manager_with(
            key_a,
            entity.clone(),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            6,
        );
        let (obj, info1) = mgr_a
            .create_object(Op(0x10), Bytes::from_static(b"v1"))
            .unwrap();
        let info2 = mgr_a
            .update_object(Op(0x11), obj.meta.id, Bytes::from_static(b"v2"))
            .unwrap();
        let create = info1.broadcast[0].clone();
        let update = info2.broadcast[0].clone();

        // b1 receives in order, twice; b2 receives reversed
        let mgr_b1 = manager_with(
            key_b.clone(),
            entity.clone(),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            7,
        );
        mgr_b1
            .handle_oplogs(vec![create.clone(), update.clone()])
            .unwrap();
        mgr_b1
            .handle_oplogs(vec![create.clone(), update.clone()])
            .unwrap();

        let mgr_b2 = manager_with(
            key_b,
            entity,
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            8,
        );
        let out = mgr_b2
            .handle_oplogs(vec![update.clone(), create.clone()])
            .unwrap();
        // the out-of-order update reported a gap to force-sync
        assert!(out.force_sync.contains(&update.id));

        let o1 = mgr_b1.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(o1.data, Bytes::from_static(b"v2"));
        let o2 = mgr_b2.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(o2.data, Bytes::from_static(b"v1"));
        // after the gap fills, b2 re-receives the deferred record
        mgr_b2.handle_oplogs(vec![update]).unwrap();
        let o2 = mgr_b2.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(o2.data, Bytes::from_static(b"v2"));
    }

    #[test]
    fn test_pending_reaches_quorum_across_masters() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(9);
        let key_a = SecretKey::generate(&mut rng);
        let key_b = SecretKey::generate(&mut rng);
        let key_c = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let mut entity = Entity::new(entity_id, key_a.id(), Timestamp::new(1, 0));
        for key in [&key_b, &key_c] {
            entity.add_member(key.id(), Timestamp::new(1, 0));
            entity.add_master(key.id(), Timestamp::new(1, 0));
        }
        let entity = Arc::new(RwLock::new(entity));
        assert_eq!(entity.read().master_quorum(), 2);

        let mgr_a = manager_with(
            key_a,
            entity.clone(),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            9,
        );
        let mgr_b = manager_with(
            key_b,
            entity.clone(),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            10,
        );

        // a is one of three masters: its create stays pending
        let (obj, info) = mgr_a
            .create_object(Op(0x10), Bytes::from_static(b"data"))
            .unwrap();
        assert_eq!(obj.meta.status, ObjectStatus::Pending);
        let pending = info.broadcast[0].clone();
        assert_eq!(pending.status(), OplogStatus::Pending);

        // b co-signs; 2 of 3 meets the quorum and the record ratifies
        let out = mgr_b.handle_pending_oplogs(vec![pending]).unwrap();
        let ratified = out
            .broadcast
            .iter()
            .find(|o| o.status() == OplogStatus::Alive)
            .expect("ratified record broadcast");
        assert!(ratified.quorum_met(2));
        let replica = mgr_b.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(replica.meta.status, ObjectStatus::Alive);

        // the doer applies the ratified record and finishes its proposal
        mgr_a.handle_oplogs(vec![ratified.clone()]).unwrap();
        let mine = mgr_a.get_object(obj.meta.id).unwrap().unwrap();
        assert_eq!(mine.meta.status, ObjectStatus::Alive);
        assert_eq!(mine.data, Bytes::from_static(b"data"));
    }

    #[test]
    fn test_non_member_doer_is_dropped() {
        // the outsider's key must not collide with the manager's own
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(99);
        let outsider = SecretKey::generate(&mut rng);
        let mgr = solo_manager(11);
        assert!(!mgr.entity().read().is_member(&outsider.id()));
        let oplog = Oplog::new(
            &outsider,
            Id::random(&mut rng),
            Timestamp::new(1_700_000_000, 0),
            Op(0x10),
            Bytes::from_static(b"x"),
            None,
            &mut rng,
        )
        .unwrap();
        let info = mgr.handle_oplogs(vec![oplog.clone()]).unwrap();
        assert!(info.is_empty());
        assert_eq!(info.rejected, 1);
        assert!(mgr.get_oplog(oplog.id).unwrap().is_none());
    }

    #[test]
    fn test_expire_pending() {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(12);
        let key_a = SecretKey::generate(&mut rng);
        let key_b = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let mut entity = Entity::new(entity_id, key_a.id(), Timestamp::new(1, 0));
        entity.add_member(key_b.id(), Timestamp::new(1, 0));
        entity.add_master(key_b.id(), Timestamp::new(1, 0));
        // two masters: nothing self-ratifies
        let mgr = manager_with(
            key_a,
            Arc::new(RwLock::new(entity)),
            Arc::new(MemStore::new()),
            fixed_clock(1_700_000_000),
            12,
        );
        let (obj, _) = mgr
            .create_object(Op(0x10), Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(mgr.pending_oplogs().unwrap().len(), 1);

        let later = Timestamp::new(1_700_000_000 + EXPIRE_OPLOG_SECS + 10, 0);
        let expired = mgr.expire_pending(later).unwrap();
        assert_eq!(expired, 1);
        assert!(mgr.pending_oplogs().unwrap().is_empty());
        assert!(mgr.get_object(obj.meta.id).unwrap().is_none());
    }

    #[test]
    fn test_system_clock_compiles_in() {
        // SystemClock is the production clock; tests elsewhere inject FixedClock
        let _mgr = manager_with(
            SecretKey::generate(&mut rand_chacha::ChaCha12Rng::seed_from_u64(13)),
            Arc::new(RwLock::new(Entity::new(
                Id::ZERO,
                Id::ZERO,
                Timestamp::ZERO,
            ))),
            Arc::new(MemStore::new()),
            Arc::new(SystemClock),
            13,
        );
    }
}
