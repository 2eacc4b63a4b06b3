//! Inbound frame dispatch and peer IO.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use iroh_metrics::{inc, inc_by};
use opmesh_base::Id;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::net::codec::{Frame, FrameCodec};
use crate::net::peer::{Peer, PeerSet};
use crate::net::SEND_TIMEOUT_SECS;
use crate::oplog::Oplog;
use crate::sync::{AddOplogs, OpCode, SyncEngine};

/// Peers past this misbehavior count should be disconnected.
pub const MISBEHAVIOR_LIMIT: u32 = 16;

/// Routes frames between peers and the per-entity sync engines.
#[derive(Debug, Default)]
pub struct Router {
    engines: RwLock<HashMap<Id, SyncEngine>>,
    peers: PeerSet,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn register_entity(&self, engine: SyncEngine) {
        let entity_id = engine.manager().entity_id();
        self.engines.write().insert(entity_id, engine);
    }

    pub fn unregister_entity(&self, entity_id: &Id) -> Option<SyncEngine> {
        self.engines.write().remove(entity_id)
    }

    pub fn engine(&self, entity_id: &Id) -> Option<SyncEngine> {
        self.engines.read().get(entity_id).cloned()
    }

    pub fn entity_ids(&self) -> Vec<Id> {
        self.engines.read().keys().copied().collect()
    }

    /// Handles one inbound frame from `peer`.
    ///
    /// Unknown op codes and unknown entities are dropped silently; protocol
    /// violations bump the peer's misbehavior count. Only fatal errors
    /// propagate.
    pub async fn dispatch(&self, peer: &Peer, frame: Frame) -> Result<()> {
        let Ok(op) = OpCode::try_from(frame.op_code) else {
            trace!(op = frame.op_code, "unknown op code dropped");
            return Ok(());
        };
        let Some(engine) = self.engine(&frame.entity_id) else {
            trace!(entity = %frame.entity_id.fmt_short(), "frame for unknown entity dropped");
            return Ok(());
        };
        if needs_fit_peer(op) && !peer.peer_type().is_fit() {
            warn!(peer = %peer.node_id().fmt_short(), ?op, "unfit peer sent gated message");
            peer.record_misbehavior();
            return Ok(());
        }
        inc!(Metrics, frames_recv);
        let outcome = match engine.handle(op, &frame.payload) {
            Ok(outcome) => outcome,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(peer = %peer.node_id().fmt_short(), ?op, %err, "bad message");
                let count = peer.record_misbehavior();
                if count >= MISBEHAVIOR_LIMIT {
                    return Err(Error::PeerMisbehaved("misbehavior limit reached"));
                }
                return Ok(());
            }
        };
        for _ in 0..outcome.info.rejected {
            let count = peer.record_misbehavior();
            if count >= MISBEHAVIOR_LIMIT {
                return Err(Error::PeerMisbehaved("misbehavior limit reached"));
            }
        }
        for (op, payload) in outcome.replies {
            self.send(peer, frame.entity_id, op, payload).await;
        }
        self.broadcast_records(frame.entity_id, outcome.info.broadcast, Some(&peer.node_id()))
            .await?;
        Ok(())
    }

    /// Announces freshly committed records to every fit peer. Announcements
    /// are never shed; a stalled peer blocks up to its send deadline.
    pub async fn broadcast_records(
        &self,
        entity_id: Id,
        records: Vec<Oplog>,
        skip: Option<&Id>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (ratified, pending): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|oplog| oplog.master_log_id.is_some());
        for (op, oplogs) in [
            (OpCode::AddOplogs, ratified),
            (OpCode::AddPendingOplogs, pending),
        ] {
            if oplogs.is_empty() {
                continue;
            }
            let frame = encode_frame(entity_id, op, &AddOplogs { oplogs })?;
            let sent = self.peers.broadcast(&frame, skip).await;
            inc_by!(Metrics, oplogs_broadcast, sent as u64);
        }
        Ok(())
    }

    /// Queues one message to one peer.
    pub async fn send(&self, peer: &Peer, entity_id: Id, op: OpCode, payload: Vec<u8>) {
        let frame = Frame {
            op_code: op.into(),
            entity_id,
            payload: Bytes::from(payload),
        };
        let sent = if op.is_oplog() {
            peer.send_oplog(frame).await
        } else {
            peer.send(frame)
        };
        if sent {
            inc!(Metrics, frames_sent);
        }
    }
}

/// Messages that may only come from a peer with confirmed membership.
fn needs_fit_peer(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::AddPendingOplog
            | OpCode::AddPendingOplogs
            | OpCode::SyncPendingOplog
            | OpCode::SyncPendingOplogAck
    )
}

fn encode_frame<T: Serialize>(entity_id: Id, op: OpCode, msg: &T) -> Result<Frame> {
    let payload = postcard::to_stdvec(msg).map_err(|_| Error::MalformedEncoding)?;
    Ok(Frame {
        op_code: op.into(),
        entity_id,
        payload: Bytes::from(payload),
    })
}

/// Runs the IO loop for one connected peer until the stream closes, the
/// token fires, or the peer misbehaves past the limit.
pub async fn run_peer<S>(
    router: Arc<Router>,
    peer: Arc<Peer>,
    stream: S,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut inbound = FramedRead::new(reader, FrameCodec);
    let mut outbound = FramedWrite::new(writer, FrameCodec);
    let send_timeout = Duration::from_secs(SEND_TIMEOUT_SECS);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer.node_id().fmt_short(), "peer loop cancelled");
                return Ok(());
            }
            frame = inbound.next() => {
                match frame {
                    Some(frame) => router.dispatch(&peer, frame?).await?,
                    None => {
                        debug!(peer = %peer.node_id().fmt_short(), "peer closed");
                        return Ok(());
                    }
                }
            }
            frame = peer.next_outgoing() => {
                tokio::time::timeout(send_timeout, outbound.send(frame))
                    .await
                    .map_err(|_| Error::PeerMisbehaved("send timeout"))??;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::manager::ProtocolManager;
    use crate::net::peer::PeerType;
    use crate::object::BytesKind;
    use crate::oplog::Op;
    use crate::store::MemStore;
    use opmesh_base::{SecretKey, SystemClock, Timestamp};
    use rand_core::SeedableRng;

    fn engine_for(key: SecretKey, entity: Arc<RwLock<Entity>>, seed: u64) -> SyncEngine {
        let rng = Box::new(rand_chacha::ChaCha12Rng::seed_from_u64(seed));
        let mut mgr = ProtocolManager::new(
            b"tst",
            entity,
            key,
            Arc::new(MemStore::new()),
            Arc::new(SystemClock),
            rng,
        )
        .unwrap();
        mgr.register_kind(Arc::new(BytesKind::new("note", b"nt", 0x10)))
            .unwrap();
        SyncEngine::new(Arc::new(mgr))
    }

    fn setup(seed: u64) -> (Router, SyncEngine, Vec<SecretKey>) {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(seed);
        let keys: Vec<SecretKey> = (0..2).map(|_| SecretKey::generate(&mut rng)).collect();
        let entity_id = Id::random(&mut rng);
        let mut entity = Entity::new(entity_id, keys[0].id(), Timestamp::new(1, 0));
        entity.add_member(keys[1].id(), Timestamp::new(1, 0));
        let engine = engine_for(keys[0].clone(), Arc::new(RwLock::new(entity)), seed);
        let router = Router::new();
        router.register_entity(engine.clone());
        (router, engine, keys)
    }

    #[tokio::test]
    async fn test_unknown_opcode_and_entity_dropped_silently() {
        let (router, engine, _) = setup(1);
        let peer = Peer::new(Id::ZERO, PeerType::Member);

        router
            .dispatch(
                &peer,
                Frame {
                    op_code: 999,
                    entity_id: engine.manager().entity_id(),
                    payload: Bytes::new(),
                },
            )
            .await
            .unwrap();

        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(2);
        router
            .dispatch(
                &peer,
                Frame {
                    op_code: OpCode::SyncOplog.into(),
                    entity_id: Id::random(&mut rng),
                    payload: Bytes::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(peer.misbehavior(), 0);
    }

    #[tokio::test]
    async fn test_unfit_peer_cannot_send_pending_records() {
        let (router, engine, keys) = setup(3);
        let peer = Peer::new(keys[1].id(), PeerType::Random);
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(4);
        let oplog = Oplog::new(
            &keys[1],
            Id::random(&mut rng),
            Timestamp::now(),
            Op(0x10),
            Bytes::from_static(b"x"),
            None,
            &mut rng,
        )
        .unwrap();
        let frame = encode_frame(
            engine.manager().entity_id(),
            OpCode::AddPendingOplogs,
            &AddOplogs {
                oplogs: vec![oplog.clone()],
            },
        )
        .unwrap();
        router.dispatch(&peer, frame.clone()).await.unwrap();
        assert_eq!(peer.misbehavior(), 1);
        assert!(engine.manager().get_oplog(oplog.id).unwrap().is_none());

        // the same frame from a member peer lands
        peer.set_peer_type(PeerType::Member);
        router.dispatch(&peer, frame).await.unwrap();
        assert!(engine.manager().get_oplog(oplog.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_payload_bumps_misbehavior() {
        let (router, engine, keys) = setup(5);
        let peer = Peer::new(keys[1].id(), PeerType::Member);
        router
            .dispatch(
                &peer,
                Frame {
                    op_code: OpCode::AddOplogs.into(),
                    entity_id: engine.manager().entity_id(),
                    payload: Bytes::from_static(b"\xff\xff\xff"),
                },
            )
            .await
            .unwrap();
        assert_eq!(peer.misbehavior(), 1);
    }

    #[tokio::test]
    async fn test_bad_record_rejected_rest_of_batch_lands() {
        let (router, engine, keys) = setup(9);
        let peer = Peer::new(keys[1].id(), PeerType::Member);
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(10);

        let mut bad = Oplog::new(
            &keys[1],
            Id::random(&mut rng),
            Timestamp::now(),
            Op(0x10),
            Bytes::from_static(b"bad"),
            None,
            &mut rng,
        )
        .unwrap();
        // tampering after signing invalidates the signature
        bad.op_data = Bytes::from_static(b"tampered");
        let good = Oplog::new(
            &keys[1],
            Id::random(&mut rng),
            Timestamp::now(),
            Op(0x10),
            Bytes::from_static(b"good"),
            None,
            &mut rng,
        )
        .unwrap();

        let frame = encode_frame(
            engine.manager().entity_id(),
            OpCode::AddOplogs,
            &AddOplogs {
                oplogs: vec![bad.clone(), good.clone()],
            },
        )
        .unwrap();
        router.dispatch(&peer, frame).await.unwrap();

        assert!(engine.manager().get_oplog(bad.id).unwrap().is_none());
        assert!(engine.manager().get_oplog(good.id).unwrap().is_some());
        assert_eq!(peer.misbehavior(), 1);
    }

    #[tokio::test]
    async fn test_run_peer_over_duplex() {
        let (router_a, engine_a, keys) = setup(6);
        let router_a = Arc::new(router_a);

        let entity = engine_a.manager().entity().read().clone();
        let engine_b = engine_for(keys[1].clone(), Arc::new(RwLock::new(entity)), 8);
        let router_b = Arc::new(Router::new());
        router_b.register_entity(engine_b.clone());

        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();

        let peer_of_b = Peer::new(keys[1].id(), PeerType::Member);
        router_a.peers().insert(peer_of_b.clone());
        let peer_of_a = Peer::new(keys[0].id(), PeerType::Member);
        router_b.peers().insert(peer_of_a.clone());

        let task_a = tokio::spawn(run_peer(
            router_a.clone(),
            peer_of_b.clone(),
            stream_a,
            cancel.clone(),
        ));
        let task_b = tokio::spawn(run_peer(
            router_b.clone(),
            peer_of_a.clone(),
            stream_b,
            cancel.clone(),
        ));

        // a commits a record and announces it
        let (obj, info) = engine_a
            .manager()
            .create_object(Op(0x10), Bytes::from_static(b"over the wire"))
            .unwrap();
        router_a
            .broadcast_records(engine_a.manager().entity_id(), info.broadcast, None)
            .await
            .unwrap();

        // b should materialise the object
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(replica) = engine_b.manager().get_object(obj.meta.id).unwrap() {
                assert_eq!(replica.data, Bytes::from_static(b"over the wire"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "replication timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
    }
}
