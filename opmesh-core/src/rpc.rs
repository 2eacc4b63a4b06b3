//! The local application-facing API.
//!
//! A thin facade over the router's entities: local mutations commit through
//! the family manager and their announcements fan out to fit peers in the
//! same call.

use std::sync::Arc;

use bytes::Bytes;
use opmesh_base::{Id, Timestamp};

use crate::error::{Error, Result};
use crate::merkle::{MerkleLevel, MerkleNode};
use crate::net::router::Router;
use crate::object::ObjectRecord;
use crate::oplog::{Op, Oplog};
use crate::sync::SyncEngine;

/// Application handle onto a running node.
#[derive(Debug, Clone)]
pub struct Api {
    router: Arc<Router>,
}

impl Api {
    pub fn new(router: Arc<Router>) -> Self {
        Api { router }
    }

    fn engine(&self, entity_id: Id) -> Result<SyncEngine> {
        self.router.engine(&entity_id).ok_or(Error::NotFound)
    }

    /// Creates an object and announces the record.
    pub async fn create_object(&self, entity_id: Id, op: Op, data: Bytes) -> Result<ObjectRecord> {
        let engine = self.engine(entity_id)?;
        let (obj, info) = engine.manager().create_object(op, data)?;
        self.router
            .broadcast_records(entity_id, info.broadcast, None)
            .await?;
        Ok(obj)
    }

    /// Proposes new payload bytes and announces the record.
    pub async fn update_object(&self, entity_id: Id, op: Op, obj_id: Id, data: Bytes) -> Result<()> {
        let engine = self.engine(entity_id)?;
        let info = engine.manager().update_object(op, obj_id, data)?;
        self.router
            .broadcast_records(entity_id, info.broadcast, None)
            .await
    }

    /// Proposes deletion and announces the record.
    pub async fn delete_object(&self, entity_id: Id, op: Op, obj_id: Id) -> Result<()> {
        let engine = self.engine(entity_id)?;
        let info = engine.manager().delete_object(op, obj_id)?;
        self.router
            .broadcast_records(entity_id, info.broadcast, None)
            .await
    }

    pub fn get_object(&self, entity_id: Id, obj_id: Id) -> Result<Option<ObjectRecord>> {
        self.engine(entity_id)?.manager().get_object(obj_id)
    }

    pub fn get_objects(&self, entity_id: Id, obj_ids: &[Id]) -> Result<Vec<ObjectRecord>> {
        let engine = self.engine(entity_id)?;
        let mut out = Vec::with_capacity(obj_ids.len());
        for obj_id in obj_ids {
            if let Some(obj) = engine.manager().get_object(*obj_id)? {
                out.push(obj);
            }
        }
        Ok(out)
    }

    /// Every object of the entity's family, id order.
    pub fn list_objects(&self, entity_id: Id) -> Result<Vec<ObjectRecord>> {
        self.engine(entity_id)?.manager().objects()
    }

    /// Alive oplogs from `from_ts` on, up to `limit`.
    pub fn get_oplog_list(
        &self,
        entity_id: Id,
        from_ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<Oplog>> {
        self.engine(entity_id)?.manager().oplogs_after(from_ts, limit)
    }

    pub fn get_pending_oplog_list(&self, entity_id: Id) -> Result<Vec<Oplog>> {
        self.engine(entity_id)?.manager().pending_oplogs()
    }

    /// Merkle nodes at one level, optionally bounded to the buckets
    /// covering `since` or later.
    pub fn get_merkle_node_list(
        &self,
        entity_id: Id,
        level: MerkleLevel,
        since: Option<Timestamp>,
    ) -> Result<Vec<MerkleNode>> {
        self.engine(entity_id)?
            .manager()
            .merkle()
            .level_nodes(level, since)
    }

    /// Requests a full merkle comparison against one fit peer. Returns
    /// `false` when no fit peer is connected.
    pub async fn force_sync_merkle(&self, entity_id: Id) -> Result<bool> {
        let engine = self.engine(entity_id)?;
        let Some(peer) = self.router.peers().any_fit() else {
            return Ok(false);
        };
        let (op, payload) = engine.start_force_sync()?;
        self.router.send(&peer, entity_id, op, payload).await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::manager::ProtocolManager;
    use crate::object::BytesKind;
    use crate::store::MemStore;
    use opmesh_base::{SecretKey, SystemClock};
    use parking_lot::RwLock;
    use rand_core::SeedableRng;

    fn api_with_entity(seed: u64) -> (Api, Id) {
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(seed);
        let key = SecretKey::generate(&mut rng);
        let entity_id = Id::random(&mut rng);
        let entity = Arc::new(RwLock::new(Entity::new(
            entity_id,
            key.id(),
            Timestamp::new(1, 0),
        )));
        let rng = Box::new(rand_chacha::ChaCha12Rng::seed_from_u64(seed + 1));
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
        let router = Arc::new(Router::new());
        router.register_entity(SyncEngine::new(Arc::new(mgr)));
        (Api::new(router), entity_id)
    }

    #[tokio::test]
    async fn test_crud_through_api() {
        let (api, entity_id) = api_with_entity(1);
        let obj = api
            .create_object(entity_id, Op(0x10), Bytes::from_static(b"v1"))
            .await
            .unwrap();
        api.update_object(entity_id, Op(0x11), obj.meta.id, Bytes::from_static(b"v2"))
            .await
            .unwrap();
        let got = api.get_object(entity_id, obj.meta.id).unwrap().unwrap();
        assert_eq!(got.data, Bytes::from_static(b"v2"));

        assert_eq!(api.list_objects(entity_id).unwrap().len(), 1);
        assert!(!api
            .get_oplog_list(entity_id, Timestamp::ZERO, 10)
            .unwrap()
            .is_empty());

        api.delete_object(entity_id, Op(0x12), obj.meta.id)
            .await
            .unwrap();
        let got = api.get_object(entity_id, obj.meta.id).unwrap().unwrap();
        assert!(got.data.is_empty());
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let (api, _) = api_with_entity(2);
        let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(3);
        let unknown = Id::random(&mut rng);
        assert!(matches!(
            api.list_objects(unknown),
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_force_sync_without_peers() {
        let (api, entity_id) = api_with_entity(4);
        assert!(!api.force_sync_merkle(entity_id).await.unwrap());
    }
}
