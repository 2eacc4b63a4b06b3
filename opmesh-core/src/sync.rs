//! The anti-entropy dialogue.
//!
//! Replication is push-first: fresh records are announced to fit peers as
//! they commit. Anti-entropy repairs whatever pushing missed: the initiator
//! sends its year-level merkle nodes, the two sides walk down through
//! differing buckets, and the differing hour exchanges leaf key sets so
//! each side can send exactly the records the other lacks.

use std::sync::Arc;
use std::time::Instant;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use opmesh_base::{Id, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::manager::ProtocolManager;
use crate::merkle::{merge_keys, MerkleKey, MerkleLevel, MerkleNode};
use crate::net::FORCE_SYNC_INTERVAL_SECS;
use crate::object::ObjectRecord;
use crate::oplog::Oplog;
use crate::process::ProcessInfo;

/// Message op codes carried in the frame header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u16)]
pub enum OpCode {
    AddOplog = 1,
    AddOplogs = 2,
    AddPendingOplog = 3,
    AddPendingOplogs = 4,
    SyncOplog = 5,
    SyncOplogAck = 6,
    SyncOplogInvalid = 7,
    ForceSyncOplogByMerkle = 8,
    ForceSyncOplogByMerkleAck = 9,
    ForceSyncOplogByOplogAck = 10,
    SyncOplogNewOplogs = 11,
    SyncOplogNewOplogsAck = 12,
    SyncPendingOplog = 13,
    SyncPendingOplogAck = 14,
    SyncCreateObject = 15,
    SyncCreateObjectAck = 16,
    SyncUpdateObject = 17,
    SyncUpdateObjectAck = 18,
    ForceSyncObject = 19,
    ForceSyncObjectAck = 20,
}

impl OpCode {
    /// Announcements that must not be shed from a full send queue.
    pub fn is_oplog(self) -> bool {
        matches!(
            self,
            OpCode::AddOplog | OpCode::AddOplogs | OpCode::AddPendingOplog | OpCode::AddPendingOplogs
        )
    }
}

/// One outgoing message: op code plus postcard payload.
pub type Reply = (OpCode, Vec<u8>);

/// Fresh records announced to a peer.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddOplogs {
    pub oplogs: Vec<Oplog>,
}

/// Merkle nodes at one level, scoped to a parent bucket below the top.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncNodes {
    pub level: MerkleLevel,
    /// Parent bucket start; `None` at the year level.
    pub bucket_ts: Option<Timestamp>,
    /// Summary lower bound. Both sides list only buckets covering it or
    /// later; `None` compares the whole level.
    pub since: Option<Timestamp>,
    pub nodes: Vec<MerkleNode>,
}

/// A child-list request for one bucket.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeRequest {
    pub level: MerkleLevel,
    pub bucket_ts: Option<Timestamp>,
}

/// Leaf key set of one hour bucket.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncKeys {
    pub bucket_ts: Timestamp,
    pub keys: Vec<MerkleKey>,
}

/// Records the sender had that the receiver lacked, and the keys the
/// sender still wants back.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncKeysAck {
    pub bucket_ts: Timestamp,
    pub oplogs: Vec<Oplog>,
    pub want: Vec<MerkleKey>,
}

/// Object payload request by object id.
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectRequest {
    pub obj_ids: Vec<Id>,
}

/// Object payload response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectResponse {
    pub objs: Vec<ObjectRecord>,
}

/// What handling one message produced.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Messages to send back to the same peer.
    pub replies: Vec<Reply>,
    /// Batch side effects; the router turns broadcasts into announcements
    /// for every fit peer.
    pub info: ProcessInfo,
}

/// The per-family message handler driving one manager.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    mgr: Arc<ProtocolManager>,
    last_force_sync: Arc<Mutex<Option<Instant>>>,
}

impl SyncEngine {
    pub fn new(mgr: Arc<ProtocolManager>) -> Self {
        SyncEngine {
            mgr,
            last_force_sync: Arc::new(Mutex::new(None)),
        }
    }

    pub fn manager(&self) -> &Arc<ProtocolManager> {
        &self.mgr
    }

    /// The opening message of an anti-entropy round.
    ///
    /// Fails with [`Error::SyncRetry`] until the merkle index has been
    /// folded at least once; an unfolded summary would advertise state the
    /// leaves do not match.
    pub fn start_sync(&self) -> Result<Reply> {
        if self.mgr.merkle().generate_ts()?.is_none() {
            return Err(Error::SyncRetry);
        }
        // regular rounds compare only what changed since the last good
        // round; a force-sync walks the whole tree
        let since = self.mgr.merkle().sync_ts()?;
        let nodes = self.mgr.merkle().level_nodes(MerkleLevel::Year, since)?;
        encode(
            OpCode::SyncOplog,
            &SyncNodes {
                level: MerkleLevel::Year,
                bucket_ts: None,
                since,
                nodes,
            },
        )
    }

    /// The opening message of a pending-record exchange.
    pub fn start_pending_sync(&self) -> Result<Reply> {
        encode(OpCode::SyncPendingOplog, &())
    }

    /// Requests the peer's merkle summary; issued after a chain gap.
    pub fn start_force_sync(&self) -> Result<Reply> {
        encode(
            OpCode::ForceSyncOplogByMerkle,
            &NodeRequest {
                level: MerkleLevel::Year,
                bucket_ts: None,
            },
        )
    }

    /// Follow-up requests for the side effects of a handled batch.
    pub fn requests_for(&self, info: &ProcessInfo) -> Result<Vec<Reply>> {
        let mut out = Vec::new();
        if !info.create_obj.is_empty() {
            out.push(encode(
                OpCode::SyncCreateObject,
                &ObjectRequest {
                    obj_ids: info.create_obj.keys().copied().collect(),
                },
            )?);
        }
        if !info.update_obj.is_empty() {
            out.push(encode(
                OpCode::SyncUpdateObject,
                &ObjectRequest {
                    obj_ids: info.update_obj.keys().copied().collect(),
                },
            )?);
        }
        if !info.force_sync.is_empty() && self.force_sync_due() {
            out.push(self.start_force_sync()?);
        }
        Ok(out)
    }

    /// At most one force-sync round per interval; gaps found in between
    /// ride along with the next one.
    fn force_sync_due(&self) -> bool {
        let mut last = self.last_force_sync.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev).as_secs() < FORCE_SYNC_INTERVAL_SECS => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Dispatches one decoded message.
    pub fn handle(&self, op: OpCode, payload: &[u8]) -> Result<SyncOutcome> {
        trace!(?op, len = payload.len(), "handling sync message");
        match op {
            OpCode::AddOplog | OpCode::AddOplogs | OpCode::ForceSyncOplogByOplogAck => {
                let msg: AddOplogs = decode(payload)?;
                let info = self.mgr.handle_oplogs(msg.oplogs)?;
                let replies = self.requests_for(&info)?;
                Ok(SyncOutcome { replies, info })
            }
            OpCode::AddPendingOplog | OpCode::AddPendingOplogs => {
                let msg: AddOplogs = decode(payload)?;
                let info = self.mgr.handle_pending_oplogs(msg.oplogs)?;
                let replies = self.requests_for(&info)?;
                Ok(SyncOutcome { replies, info })
            }
            OpCode::SyncOplog
            | OpCode::SyncOplogAck
            | OpCode::ForceSyncOplogByMerkleAck => {
                let msg: SyncNodes = decode(payload)?;
                self.diff_nodes(msg)
            }
            OpCode::SyncOplogInvalid => {
                warn!("peer reported our merkle state invalid, rebuilding");
                let now = self.mgr.now();
                self.mgr.merkle().set_fail_sync_ts(now)?;
                self.mgr.merkle().rebuild(now)?;
                Ok(SyncOutcome {
                    replies: vec![self.start_sync()?],
                    info: ProcessInfo::default(),
                })
            }
            OpCode::ForceSyncOplogByMerkle => {
                let msg: NodeRequest = decode(payload)?;
                let nodes = match msg.bucket_ts {
                    None => self.mgr.merkle().level_nodes(MerkleLevel::Year, None)?,
                    Some(ts) => self.mgr.merkle().children_of(msg.level, ts)?,
                };
                Ok(SyncOutcome {
                    replies: vec![encode(
                        OpCode::ForceSyncOplogByMerkleAck,
                        &SyncNodes {
                            level: msg.bucket_ts.map_or(msg.level, |_| {
                                msg.level.child().unwrap_or(MerkleLevel::Now)
                            }),
                            bucket_ts: msg.bucket_ts,
                            since: None,
                            nodes,
                        },
                    )?],
                    info: ProcessInfo::default(),
                })
            }
            OpCode::SyncOplogNewOplogs => {
                let msg: SyncKeys = decode(payload)?;
                let mine = self.mgr.merkle().leaf_keys(msg.bucket_ts)?;
                let (only_mine, only_theirs) = merge_keys(&mine, &msg.keys);
                let oplogs = self.mgr.oplogs_by_keys(&only_mine)?;
                Ok(SyncOutcome {
                    replies: vec![encode(
                        OpCode::SyncOplogNewOplogsAck,
                        &SyncKeysAck {
                            bucket_ts: msg.bucket_ts,
                            oplogs,
                            want: only_theirs,
                        },
                    )?],
                    info: ProcessInfo::default(),
                })
            }
            OpCode::SyncOplogNewOplogsAck => {
                let msg: SyncKeysAck = decode(payload)?;
                let info = self.mgr.handle_oplogs(msg.oplogs)?;
                let mut replies = self.requests_for(&info)?;
                if !msg.want.is_empty() {
                    let oplogs = self.mgr.oplogs_by_keys(&msg.want)?;
                    replies.push(encode(
                        OpCode::ForceSyncOplogByOplogAck,
                        &AddOplogs { oplogs },
                    )?);
                }
                self.mgr.merkle().set_sync_ts(self.mgr.now())?;
                Ok(SyncOutcome { replies, info })
            }
            OpCode::SyncPendingOplog => {
                let oplogs = self.mgr.pending_oplogs()?;
                Ok(SyncOutcome {
                    replies: vec![encode(
                        OpCode::SyncPendingOplogAck,
                        &AddOplogs { oplogs },
                    )?],
                    info: ProcessInfo::default(),
                })
            }
            OpCode::SyncPendingOplogAck => {
                let msg: AddOplogs = decode(payload)?;
                let info = self.mgr.handle_pending_oplogs(msg.oplogs)?;
                let replies = self.requests_for(&info)?;
                Ok(SyncOutcome { replies, info })
            }
            OpCode::SyncCreateObject | OpCode::SyncUpdateObject | OpCode::ForceSyncObject => {
                let msg: ObjectRequest = decode(payload)?;
                let mut objs = Vec::with_capacity(msg.obj_ids.len());
                for obj_id in msg.obj_ids {
                    if let Some(obj) = self.mgr.get_object(obj_id)? {
                        objs.push(obj);
                    }
                }
                let ack = match op {
                    OpCode::SyncCreateObject => OpCode::SyncCreateObjectAck,
                    OpCode::SyncUpdateObject => OpCode::SyncUpdateObjectAck,
                    _ => OpCode::ForceSyncObjectAck,
                };
                Ok(SyncOutcome {
                    replies: vec![encode(ack, &ObjectResponse { objs })?],
                    info: ProcessInfo::default(),
                })
            }
            OpCode::SyncCreateObjectAck | OpCode::SyncUpdateObjectAck => {
                let msg: ObjectResponse = decode(payload)?;
                for obj in &msg.objs {
                    self.mgr.fill_object(obj)?;
                }
                Ok(SyncOutcome::default())
            }
            OpCode::ForceSyncObjectAck => {
                let msg: ObjectResponse = decode(payload)?;
                for obj in &msg.objs {
                    self.mgr.force_set_object(obj)?;
                }
                Ok(SyncOutcome::default())
            }
        }
    }

    /// Compares a peer's nodes at one level against ours and descends
    /// through the buckets that differ.
    fn diff_nodes(&self, msg: SyncNodes) -> Result<SyncOutcome> {
        let mine = match (msg.level, msg.bucket_ts) {
            (MerkleLevel::Year, _) | (_, None) => {
                self.mgr.merkle().level_nodes(msg.level, msg.since)?
            }
            (level, Some(parent_ts)) => {
                // parent bucket one level up
                let parent = match level {
                    MerkleLevel::Now => MerkleLevel::Hour,
                    MerkleLevel::Hour => MerkleLevel::Day,
                    MerkleLevel::Day => MerkleLevel::Month,
                    MerkleLevel::Month => MerkleLevel::Year,
                    MerkleLevel::Year => unreachable!(),
                };
                self.mgr.merkle().children_of(parent, parent_ts)?
            }
        };
        let mut replies = Vec::new();
        for bucket_ts in differing_buckets(&mine, &msg.nodes) {
            if msg.level == MerkleLevel::Hour {
                let keys = self.mgr.merkle().leaf_keys(bucket_ts)?;
                replies.push(encode(
                    OpCode::SyncOplogNewOplogs,
                    &SyncKeys { bucket_ts, keys },
                )?);
            } else if let Some(child) = msg.level.child() {
                let nodes = self.mgr.merkle().children_of(msg.level, bucket_ts)?;
                replies.push(encode(
                    OpCode::SyncOplogAck,
                    &SyncNodes {
                        level: child,
                        bucket_ts: Some(bucket_ts),
                        since: None,
                        nodes,
                    },
                )?);
            }
        }
        if !replies.is_empty() {
            debug!(level = ?msg.level, n = replies.len(), "merkle diff descends");
        }
        Ok(SyncOutcome {
            replies,
            info: ProcessInfo::default(),
        })
    }
}

/// Bucket starts where the two node lists disagree, either side.
fn differing_buckets(mine: &[MerkleNode], theirs: &[MerkleNode]) -> Vec<Timestamp> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < mine.len() && j < theirs.len() {
        match mine[i].ts.cmp(&theirs[j].ts) {
            std::cmp::Ordering::Less => {
                out.push(mine[i].ts);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(theirs[j].ts);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                if mine[i].addr != theirs[j].addr {
                    out.push(mine[i].ts);
                }
                i += 1;
                j += 1;
            }
        }
    }
    out.extend(mine[i..].iter().map(|n| n.ts));
    out.extend(theirs[j..].iter().map(|n| n.ts));
    out
}

pub(crate) fn encode<T: Serialize>(op: OpCode, msg: &T) -> Result<Reply> {
    let payload = postcard::to_stdvec(msg).map_err(|_| Error::MalformedEncoding)?;
    Ok((op, payload))
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    postcard::from_bytes(payload).map_err(|_| Error::MalformedEncoding)
}
