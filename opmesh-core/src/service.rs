//! The node-level service: entity registry, peer connections and the
//! maintenance loops that keep every family's index and pending queue
//! healthy.

use std::sync::Arc;
use std::time::Duration;

use iroh_metrics::inc;
use opmesh_base::{Clock, Id, SecretKey, SystemClock, Timestamp};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::manager::ProtocolManager;
use crate::metrics::Metrics;
use crate::net::peer::{Peer, PeerType};
use crate::net::router::{run_peer, Router};
use crate::object::ObjectKind;
use crate::store::StorageAdapter;
use crate::sync::SyncEngine;

/// A wall clock that never repeats or reverses a reading.
///
/// Wall time can step backwards under NTP; record timestamps must not.
#[derive(Debug)]
pub struct MonotonicClock {
    inner: Arc<dyn Clock>,
    last: Mutex<Timestamp>,
}

impl MonotonicClock {
    pub fn new(inner: Arc<dyn Clock>) -> Self {
        MonotonicClock {
            inner,
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let wall = self.inner.now();
        let mut last = self.last.lock();
        let now = if wall > *last { wall } else { last.next_tick() };
        *last = now;
        now
    }
}

/// Tunables for the service loops.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Key-layout prefix shared by every family this service hosts.
    pub family_prefix: Vec<u8>,
    /// Seconds between merkle generations and expiry sweeps.
    pub maintain_interval_secs: u64,
    /// Seconds between anti-entropy rounds against a fit peer.
    pub sync_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            family_prefix: b"op".to_vec(),
            maintain_interval_secs: 10,
            sync_interval_secs: 30,
        }
    }
}

/// One running node: its key, storage, peers and entities.
#[derive(Debug)]
pub struct Service {
    key: SecretKey,
    store: Arc<dyn StorageAdapter>,
    clock: Arc<MonotonicClock>,
    router: Arc<Router>,
    config: ServiceConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(key: SecretKey, store: Arc<dyn StorageAdapter>, config: ServiceConfig) -> Self {
        Service {
            key,
            store,
            clock: Arc::new(MonotonicClock::system()),
            router: Arc::new(Router::new()),
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn my_id(&self) -> Id {
        self.key.id()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Registers an entity, builds its manager and starts its maintenance
    /// loop. Returns the engine for local operations.
    pub fn register_entity(
        &self,
        entity: Arc<RwLock<Entity>>,
        kinds: Vec<Arc<dyn ObjectKind>>,
    ) -> Result<SyncEngine> {
        let entity_id = entity.read().entity_id;
        if self.router.engine(&entity_id).is_some() {
            return Err(Error::AlreadyExists);
        }
        let rng = Box::new(StdRng::from_entropy());
        let mut mgr = ProtocolManager::new(
            &self.config.family_prefix,
            entity,
            self.key.clone(),
            self.store.clone(),
            self.clock.clone(),
            rng,
        )?;
        for kind in kinds {
            mgr.register_kind(kind)?;
        }
        let engine = SyncEngine::new(Arc::new(mgr));
        self.router.register_entity(engine.clone());
        self.spawn_maintenance(engine.clone());
        info!(entity = %entity_id.fmt_short(), "entity registered");
        Ok(engine)
    }

    /// Attaches a connected peer and runs its IO until the stream closes or
    /// the service shuts down.
    pub fn connect_peer<S>(&self, node_id: Id, peer_type: PeerType, stream: S) -> Arc<Peer>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = Peer::new(node_id, peer_type);
        self.router.peers().insert(peer.clone());
        let router = self.router.clone();
        let cancel = self.cancel.clone();
        let io_peer = peer.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = run_peer(router.clone(), io_peer.clone(), stream, cancel).await {
                warn!(peer = %io_peer.node_id().fmt_short(), %err, "peer loop ended");
            }
            router.peers().remove(&io_peer.node_id());
        });
        self.tasks.lock().push(task);
        peer
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(%err, "task panicked during shutdown");
                }
            }
        }
    }

    fn spawn_maintenance(&self, engine: SyncEngine) {
        let clock = self.clock.clone();
        let router = self.router.clone();
        let cancel = self.cancel.clone();
        let maintain_every = Duration::from_secs(self.config.maintain_interval_secs);
        let sync_every = Duration::from_secs(self.config.sync_interval_secs);
        let task = tokio::spawn(async move {
            let mut maintain_tick = tokio::time::interval(maintain_every);
            let mut sync_tick = tokio::time::interval(sync_every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = maintain_tick.tick() => {
                        if let Err(err) = maintain(&engine, clock.now()) {
                            if err.is_fatal() {
                                error!(%err, "maintenance failed fatally");
                                cancel.cancel();
                                return;
                            }
                            warn!(%err, "maintenance error");
                        }
                    }
                    _ = sync_tick.tick() => {
                        if let Err(err) = initiate_sync(&router, &engine).await {
                            warn!(%err, "sync initiation error");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

/// One maintenance pass: fold the merkle index, verify it, sweep expired
/// pending records.
fn maintain(engine: &SyncEngine, now: Timestamp) -> Result<()> {
    let mgr = engine.manager();
    mgr.merkle().generate(now)?;
    inc!(Metrics, merkle_generations);
    if let Err(Error::Corrupted) = mgr.merkle().validate() {
        warn!(entity = %mgr.entity_id().fmt_short(), "merkle index corrupted, rebuilding");
        mgr.merkle().rebuild(now)?;
        inc!(Metrics, merkle_rebuilds);
    }
    let expired = mgr.expire_pending(now)?;
    if expired > 0 {
        debug!(entity = %mgr.entity_id().fmt_short(), expired, "swept expired records");
    }
    for oplog in mgr.quorum_stalled(now)? {
        let need = mgr.entity().read().master_quorum();
        warn!(
            oplog = %oplog.id.fmt_short(),
            got = oplog.master_sigs.len(),
            need,
            "record still waiting for its quorum"
        );
    }
    Ok(())
}

/// Starts an anti-entropy round against one fit peer, if any is connected.
async fn initiate_sync(router: &Router, engine: &SyncEngine) -> Result<()> {
    let Some(peer) = router.peers().any_fit() else {
        return Ok(());
    };
    let entity_id = engine.manager().entity_id();
    let (op, payload) = match engine.start_sync() {
        Ok(reply) => reply,
        // the index has not been folded yet; the next tick retries
        Err(Error::SyncRetry) => return Ok(()),
        Err(err) => return Err(err),
    };
    router.send(&peer, entity_id, op, payload).await;
    let (op, payload) = engine.start_pending_sync()?;
    router.send(&peer, entity_id, op, payload).await;
    inc!(Metrics, sync_rounds);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BytesKind;
    use crate::oplog::Op;
    use crate::store::MemStore;
    use bytes::Bytes;
    use rand_core::SeedableRng as _;

    fn test_service(seed: u64) -> (Service, Arc<RwLock<Entity>>) {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(seed);
        let key = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let entity = Arc::new(RwLock::new(Entity::new(
            entity_id,
            key.id(),
            Timestamp::new(1, 0),
        )));
        let service = Service::new(key, Arc::new(MemStore::new()), ServiceConfig::default());
        (service, entity)
    }

    #[test]
    fn test_monotonic_clock_never_reverses() {
        #[derive(Debug)]
        struct BackwardsClock(Mutex<Vec<Timestamp>>);
        impl Clock for BackwardsClock {
            fn now(&self) -> Timestamp {
                self.0.lock().pop().unwrap_or(Timestamp::ZERO)
            }
        }
        // wall readings: 100, 50 (stepped back), 200
        let wall = BackwardsClock(Mutex::new(vec![
            Timestamp::new(200, 0),
            Timestamp::new(50, 0),
            Timestamp::new(100, 0),
        ]));
        let clock = MonotonicClock::new(Arc::new(wall));
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert_eq!(a, Timestamp::new(100, 0));
        assert!(b > a);
        assert_eq!(c, Timestamp::new(200, 0));
    }

    #[tokio::test]
    async fn test_register_entity_and_mutate() {
        let (service, entity) = test_service(1);
        let kinds: Vec<Arc<dyn ObjectKind>> =
            vec![Arc::new(BytesKind::new("note", b"nt", 0x10))];
        let engine = service.register_entity(entity.clone(), kinds.clone()).unwrap();
        assert!(matches!(
            service.register_entity(entity, kinds),
            Err(Error::AlreadyExists)
        ));

        let (obj, _) = engine
            .manager()
            .create_object(Op(0x10), Bytes::from_static(b"hi"))
            .unwrap();
        assert!(engine.manager().get_object(obj.meta.id).unwrap().is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_services_replicate_over_duplex() {
        let (service_a, entity_a) = test_service(2);
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(3);
        let key_b = SecretKey::generate(&mut rng);
        entity_a
            .write()
            .add_member(key_b.id(), Timestamp::new(2, 0));
        let entity_b = Arc::new(RwLock::new(entity_a.read().clone()));

        let service_b = Service::new(
            key_b,
            Arc::new(MemStore::new()),
            ServiceConfig::default(),
        );
        let kinds: Vec<Arc<dyn ObjectKind>> =
            vec![Arc::new(BytesKind::new("note", b"nt", 0x10))];
        let engine_a = service_a.register_entity(entity_a, kinds.clone()).unwrap();
        let engine_b = service_b.register_entity(entity_b, kinds).unwrap();

        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
        service_a.connect_peer(service_b.my_id(), PeerType::Member, stream_a);
        service_b.connect_peer(service_a.my_id(), PeerType::Member, stream_b);

        let (obj, info) = engine_a
            .manager()
            .create_object(Op(0x10), Bytes::from_static(b"replicated"))
            .unwrap();
        service_a
            .router()
            .broadcast_records(engine_a.manager().entity_id(), info.broadcast, None)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(replica) = engine_b.manager().get_object(obj.meta.id).unwrap() {
                assert_eq!(replica.data, Bytes::from_static(b"replicated"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "replication timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        service_a.shutdown().await;
        service_b.shutdown().await;
    }
}
