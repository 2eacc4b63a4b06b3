//! Error taxonomy for the replication core.
//!
//! Every failure surface is named; no silent `None` returns. Validation
//! failures stay inside the batch that produced them, protocol failures
//! drive the sync state machines, and `Db`/`Unrecoverable` stop the entity.

use opmesh_base::Id;

/// Result alias used throughout the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // validation
    #[error("invalid data")]
    InvalidData,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid id")]
    InvalidId,
    #[error("invalid op code {0}")]
    InvalidOp(u16),
    #[error("malformed encoding")]
    MalformedEncoding,

    // storage
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("storage failure: {0}")]
    Db(String),
    #[error("corrupted merkle index")]
    Corrupted,

    // protocol
    #[error("sync should be retried")]
    SyncRetry,
    #[error("force sync required for {0}")]
    ForceSyncRequired(Id),
    #[error("quorum not met ({got}/{need})")]
    QuorumNotMet { got: usize, need: usize },
    #[error("peer misbehaved: {0}")]
    PeerMisbehaved(&'static str),

    // capability
    #[error("not a master")]
    NotMaster,
    #[error("not a member")]
    NotMember,
    #[error("expired")]
    Expired,

    // transport
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    // fatal
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl Error {
    /// Whether this error must stop the entity rather than the operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Db(_) | Error::Unrecoverable(_))
    }
}
