//! The oplog record: the immutable, signed, hash-chained unit of replication.
//!
//! A record is signed by its doer over a canonical big-endian encoding of
//! `(id, doer_id, obj_id, ts, op, op_data, prev_id, prev_hash, salt)`. The
//! record hash is the blake3 of that same preimage, so master co-signatures
//! never change it. Ratification is a quorum of master co-signatures over the
//! identical preimage.

use bytes::Bytes;
use opmesh_base::{Id, PublicKey, Salt, SecretKey, Signature, Timestamp};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire format version.
pub const OPLOG_VERSION: u8 = 1;

/// Co-sign requests older than this many seconds are refused.
pub const EXPIRE_OPLOG_SECS: u64 = 900;

/// Seconds a local proposal waits for its quorum before the wait is
/// surfaced to callers. The record itself is retained for retry.
pub const QUORUM_WAIT_SECS: u64 = 300;

/// A family-specific operation verb carried by an oplog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Op(pub u16);

impl Op {
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

/// A 32-byte record hash (blake3 over the signed preimage).
pub type LogHash = [u8; 32];

/// The all-zero hash, used as `prev_hash` for the first record of a doer.
pub const ZERO_HASH: LogHash = [0u8; 32];

/// One co-signature over an oplog preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInfo {
    pub id: Id,
    pub sig: Signature,
}

/// Replication status of a single oplog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OplogStatus {
    /// Produced but not yet signed by anyone beyond the doer.
    Queued,
    /// Co-signed by this node's own devices only.
    InternalPending,
    /// Waiting for the master quorum.
    Pending,
    /// Ratified by the quorum.
    Alive,
    /// Superseded by a competing ratified record.
    Invalid,
    /// Failed validation.
    Failed,
    /// Older than the retention horizon.
    Expired,
}

/// A signed, hash-chained replication record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Oplog {
    pub id: Id,
    pub doer_id: Id,
    pub obj_id: Id,
    pub ts: Timestamp,
    pub op: Op,
    pub op_data: Bytes,
    /// Previous oplog by the same doer in this family, if any.
    pub prev_id: Option<Id>,
    /// Hash of the previous oplog by the same doer, or all-zero.
    pub prev_hash: LogHash,
    pub salt: Salt,
    pub sig: Signature,
    pub hash: LogHash,
    /// Present once the master quorum ratified the record.
    pub master_log_id: Option<Id>,
    /// Master co-signatures, kept sorted by signer id.
    pub master_sigs: Vec<SignInfo>,
    /// Own-node co-signatures; cleared at ratification, so distributed
    /// records never carry them.
    #[serde(default)]
    pub internal_sigs: Vec<SignInfo>,
    /// Last local mutation time; drives the merkle bucket key.
    pub update_ts: Timestamp,
    /// Whether the payload this record refers to is locally available.
    pub is_sync: bool,
    /// Set on records received ahead of our own chain head.
    pub is_newer: bool,
}

impl Oplog {
    /// Produces a fresh, signed record.
    ///
    /// `prev` is the doer's chain head in this family, or `None` for the
    /// first record.
    pub fn new<R: RngCore + ?Sized>(
        key: &SecretKey,
        obj_id: Id,
        ts: Timestamp,
        op: Op,
        op_data: Bytes,
        prev: Option<(Id, LogHash)>,
        rng: &mut R,
    ) -> Result<Oplog> {
        let (prev_id, prev_hash) = match prev {
            Some((id, hash)) => (Some(id), hash),
            None => (None, ZERO_HASH),
        };
        let mut oplog = Oplog {
            id: Id::random(rng),
            doer_id: key.id(),
            obj_id,
            ts,
            op,
            op_data,
            prev_id,
            prev_hash,
            salt: Salt::generate(rng),
            sig: Signature::from_bytes([0u8; Signature::LEN]),
            hash: ZERO_HASH,
            master_log_id: None,
            master_sigs: Vec::new(),
            internal_sigs: Vec::new(),
            update_ts: ts,
            is_sync: true,
            is_newer: false,
        };
        let preimage = oplog.preimage();
        oplog.hash = *blake3::hash(&preimage).as_bytes();
        oplog.sig = key.sign(&preimage);
        Ok(oplog)
    }

    /// The canonical signed preimage.
    ///
    /// Deterministic, big-endian, length-prefixed where variable. Signature,
    /// co-signatures and hash are excluded.
    pub fn preimage(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + 3 * Id::LEN
                + Timestamp::WIRE_LEN
                + 2
                + 4
                + self.op_data.len()
                + Id::LEN
                + 32
                + Salt::LEN,
        );
        out.push(OPLOG_VERSION);
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(self.doer_id.as_bytes());
        out.extend_from_slice(self.obj_id.as_bytes());
        out.extend_from_slice(&self.ts.to_bytes());
        out.extend_from_slice(&self.op.to_be_bytes());
        out.extend_from_slice(&(self.op_data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.op_data);
        out.extend_from_slice(self.prev_id.unwrap_or(Id::ZERO).as_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(self.salt.as_bytes());
        out
    }

    /// Full wire encoding per the framing contract.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.preimage();
        out.extend_from_slice(self.master_log_id.unwrap_or(Id::ZERO).as_bytes());
        out.push(self.master_sigs.len() as u8);
        for sign in &self.master_sigs {
            out.extend_from_slice(sign.id.as_bytes());
            out.extend_from_slice(sign.sig.as_bytes());
        }
        out.extend_from_slice(self.sig.as_bytes());
        out.extend_from_slice(&self.hash);
        out
    }

    /// Parses a wire encoding. Strict: trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Oplog> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != OPLOG_VERSION {
            return Err(Error::MalformedEncoding);
        }
        let id = r.id()?;
        let doer_id = r.id()?;
        let obj_id = r.id()?;
        let ts = r.timestamp()?;
        let op = Op(r.u16()?);
        let data_len = r.u32()? as usize;
        let op_data = Bytes::copy_from_slice(r.bytes(data_len)?);
        let prev_id = r.optional_id()?;
        let prev_hash = r.hash()?;
        let salt = Salt::from_bytes(
            r.bytes(Salt::LEN)?
                .try_into()
                .map_err(|_| Error::MalformedEncoding)?,
        );
        let master_log_id = r.optional_id()?;
        let n_sigs = r.u8()? as usize;
        let mut master_sigs = Vec::with_capacity(n_sigs);
        for _ in 0..n_sigs {
            let sign_id = r.id()?;
            let sig =
                Signature::from_slice(r.bytes(Signature::LEN)?).ok_or(Error::MalformedEncoding)?;
            master_sigs.push(SignInfo { id: sign_id, sig });
        }
        let sig = Signature::from_slice(r.bytes(Signature::LEN)?).ok_or(Error::MalformedEncoding)?;
        let hash = r.hash()?;
        r.finish()?;

        Ok(Oplog {
            id,
            doer_id,
            obj_id,
            ts,
            op,
            op_data,
            prev_id,
            prev_hash,
            salt,
            sig,
            hash,
            master_log_id,
            master_sigs,
            internal_sigs: Vec::new(),
            update_ts: ts,
            is_sync: false,
            is_newer: false,
        })
    }

    /// Checks hash and doer signature, then every carried co-signature.
    pub fn verify(&self) -> Result<()> {
        let preimage = self.preimage();
        if *blake3::hash(&preimage).as_bytes() != self.hash {
            return Err(Error::InvalidData);
        }
        let doer_key = PublicKey::from_id(&self.doer_id).map_err(|_| Error::InvalidId)?;
        doer_key
            .verify(&preimage, &self.sig)
            .map_err(|_| Error::InvalidSignature)?;
        for sign in &self.master_sigs {
            let key = PublicKey::from_id(&sign.id).map_err(|_| Error::InvalidId)?;
            key.verify(&preimage, &sign.sig)
                .map_err(|_| Error::InvalidSignature)?;
        }
        Ok(())
    }

    /// Orders two records by `(ts, id)`.
    pub fn is_newer_than(&self, other: &Oplog) -> bool {
        (self.ts, self.id) > (other.ts, other.id)
    }

    /// Replication status derived from the carried signatures.
    pub fn status(&self) -> OplogStatus {
        if self.master_log_id.is_some() {
            OplogStatus::Alive
        } else if !self.master_sigs.is_empty() {
            OplogStatus::Pending
        } else if !self.internal_sigs.is_empty() {
            OplogStatus::InternalPending
        } else {
            OplogStatus::Queued
        }
    }

    /// Appends a master co-signature, sorted by signer id.
    ///
    /// Refused for records older than the retention horizon.
    pub fn master_sign(&mut self, key: &SecretKey, now: Timestamp) -> Result<()> {
        if self.ts < now.saturating_sub_secs(EXPIRE_OPLOG_SECS) {
            return Err(Error::Expired);
        }
        let sign = SignInfo {
            id: key.id(),
            sig: key.sign(&self.preimage()),
        };
        insert_sign(&mut self.master_sigs, sign);
        self.update_ts = now;
        Ok(())
    }

    /// Appends an own-node co-signature. Never distributed.
    pub fn internal_sign(&mut self, key: &SecretKey, now: Timestamp) -> Result<()> {
        if self.ts < now.saturating_sub_secs(EXPIRE_OPLOG_SECS) {
            return Err(Error::Expired);
        }
        let sign = SignInfo {
            id: key.id(),
            sig: key.sign(&self.preimage()),
        };
        insert_sign(&mut self.internal_sigs, sign);
        self.update_ts = now;
        Ok(())
    }

    /// Verifies the co-signature set against an entity's master set and
    /// quorum requirement.
    pub fn verify_master_signs<'a>(
        &self,
        masters: impl Iterator<Item = &'a Id>,
        quorum: usize,
    ) -> Result<()> {
        let masters: std::collections::BTreeSet<&Id> = masters.collect();
        let preimage = self.preimage();
        let mut got = 0usize;
        let mut seen = std::collections::BTreeSet::new();
        for sign in &self.master_sigs {
            if !masters.contains(&sign.id) {
                return Err(Error::NotMaster);
            }
            let key = PublicKey::from_id(&sign.id).map_err(|_| Error::InvalidId)?;
            key.verify(&preimage, &sign.sig)
                .map_err(|_| Error::InvalidSignature)?;
            if seen.insert(sign.id) {
                got += 1;
            }
        }
        if got < quorum {
            return Err(Error::QuorumNotMet { got, need: quorum });
        }
        Ok(())
    }

    /// Marks the record ratified. Internal signs are dropped; they carried
    /// no weight once the quorum signed.
    pub fn ratify(&mut self, master_log_id: Id, now: Timestamp) {
        self.master_log_id = Some(master_log_id);
        self.internal_sigs.clear();
        self.update_ts = now;
    }

    /// Whether the quorum is met by the current co-signature set.
    pub fn quorum_met(&self, quorum: usize) -> bool {
        let distinct: std::collections::BTreeSet<Id> =
            self.master_sigs.iter().map(|s| s.id).collect();
        distinct.len() >= quorum
    }

    /// Integrates a stored copy of the same record into `self`.
    ///
    /// Both carry the same preimage (same id, same hash); only the signature
    /// sets may differ. Returns `true` when `self` gained signatures the
    /// stored copy did not have, i.e. the merged record must be re-saved.
    pub fn integrate_existing(&mut self, orig: &Oplog) -> Result<bool> {
        if self.hash != orig.hash {
            // Same id, different preimage: resolve instead of merging.
            return Err(Error::InvalidData);
        }
        if self.status() <= orig.status() {
            self.is_sync = orig.is_sync;
        }
        // A ratified copy wins outright.
        if orig.master_log_id.is_some() && self.master_log_id.is_none() {
            self.master_log_id = orig.master_log_id;
            self.master_sigs = orig.master_sigs.clone();
            self.update_ts = orig.update_ts;
            return Ok(false);
        }
        if self.master_log_id.is_some() {
            return Ok(orig.master_log_id.is_none());
        }
        let merged_masters = merge_signs(&self.master_sigs, &orig.master_sigs);
        let merged_internals = merge_signs(&self.internal_sigs, &orig.internal_sigs);
        let grew = merged_masters.len() > orig.master_sigs.len()
            || merged_internals.len() > orig.internal_sigs.len();
        self.master_sigs = merged_masters;
        self.internal_sigs = merged_internals;
        if !grew {
            self.update_ts = orig.update_ts;
        }
        Ok(grew)
    }

    /// Picks between two ratified copies of the same record id that disagree.
    ///
    /// Earlier `update_ts` wins, then lexicographically smaller hash. Returns
    /// `true` when `self` is the winner and should replace the stored copy.
    pub fn select_existing(&mut self, orig: &Oplog) -> bool {
        if self.hash == orig.hash {
            return false;
        }
        if orig.master_log_id.is_none() {
            return true;
        }
        if self.master_log_id.is_none() {
            self.adopt(orig);
            return false;
        }
        let keep_self = (self.update_ts, self.hash) < (orig.update_ts, orig.hash);
        if !keep_self {
            self.adopt(orig);
        }
        keep_self
    }

    fn adopt(&mut self, orig: &Oplog) {
        self.update_ts = orig.update_ts;
        self.hash = orig.hash;
        self.salt = orig.salt;
        self.sig = orig.sig;
        self.op_data = orig.op_data.clone();
        self.master_log_id = orig.master_log_id;
        self.master_sigs = orig.master_sigs.clone();
        self.internal_sigs = orig.internal_sigs.clone();
    }
}

fn insert_sign(signs: &mut Vec<SignInfo>, sign: SignInfo) {
    match signs.binary_search_by(|s| s.id.cmp(&sign.id)) {
        Ok(idx) => signs[idx] = sign,
        Err(idx) => signs.insert(idx, sign),
    }
}

/// Unions two sign sets, ordered by signer id.
fn merge_signs(a: &[SignInfo], b: &[SignInfo]) -> Vec<SignInfo> {
    let mut out = a.to_vec();
    for sign in b {
        if out.binary_search_by(|s| s.id.cmp(&sign.id)).is_err() {
            insert_sign(&mut out, *sign);
        }
    }
    out
}

/// A bounds-checked cursor over a wire buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedEncoding);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn id(&mut self) -> Result<Id> {
        Id::from_slice(self.bytes(Id::LEN)?).ok_or(Error::MalformedEncoding)
    }

    fn optional_id(&mut self) -> Result<Option<Id>> {
        let id = self.id()?;
        Ok(if id.is_zero() { None } else { Some(id) })
    }

    fn hash(&mut self) -> Result<LogHash> {
        self.bytes(32)?.try_into().map_err(|_| Error::MalformedEncoding)
    }

    fn timestamp(&mut self) -> Result<Timestamp> {
        Timestamp::from_bytes(self.bytes(Timestamp::WIRE_LEN)?).ok_or(Error::MalformedEncoding)
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::MalformedEncoding);
        }
        Ok(())
    }
}
