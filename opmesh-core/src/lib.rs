//! Replicated-object core for a peer-to-peer personal data network.
//!
//! Every mutation is an oplog: a signed, hash-chained record minted by its
//! doer and ratified by a quorum of the entity's masters. Objects are the
//! state those records build; a time-bucketed merkle index over each
//! family's records drives anti-entropy between peers; a small message
//! router moves frames over any byte stream.
//!
//! The crate is storage- and transport-agnostic: persistence goes through
//! [`store::StorageAdapter`], peers through anything `AsyncRead + AsyncWrite`.

#![deny(missing_debug_implementations)]

pub mod entity;
pub mod error;
pub mod manager;
pub mod merkle;
pub mod metrics;
pub mod net;
pub mod object;
pub mod oplog;
pub mod process;
pub mod rpc;
pub mod service;
pub mod store;
pub mod sync;

pub use entity::Entity;
pub use error::{Error, Result};
pub use manager::ProtocolManager;
pub use object::{ObjectKind, ObjectRecord, ObjectStatus};
pub use oplog::{Op, Oplog, OplogStatus};
pub use rpc::Api;
pub use service::{Service, ServiceConfig};
pub use store::{MemStore, StorageAdapter};
pub use sync::{OpCode, SyncEngine};
