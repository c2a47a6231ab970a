use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use mongodb::bson::{Bson, Document};
use serde_json::Value;

use super::{DATA_FIELD, EntityStorage};
use crate::dao::{
    models::EntityId,
    normalize::{encode, normalize},
    storage::{StorageError, StorageResult},
};

type Collection = HashMap<EntityId, Document>;

/// In-process [`EntityStorage`].
///
/// Entities are kept as the same BSON documents the MongoDB backend persists, so reads go
/// through the normalizer exactly like they would against a real server.
#[derive(Clone, Default)]
pub struct MemoryEntityStorage {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    collections: DashMap<String, Collection>,
    closed: AtomicBool,
}

impl MemoryEntityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed());
        }
        Ok(())
    }

    async fn write_entity(&self, type_name: String, id: EntityId, data: Bson) -> StorageResult<()> {
        self.ensure_open()?;
        let mut document = Document::new();
        document.insert(DATA_FIELD, data);

        self.inner
            .collections
            .entry(type_name)
            .or_default()
            .insert(id, document);
        Ok(())
    }

    async fn read_entity(&self, type_name: String, id: EntityId) -> StorageResult<Value> {
        self.ensure_open()?;
        let data = self
            .inner
            .collections
            .get(&type_name)
            .and_then(|collection| {
                collection
                    .get(&id)
                    .map(|document| document.get(DATA_FIELD).cloned())
            })
            .ok_or_else(|| StorageError::not_found(&type_name, id.as_str()))?;

        data.map(normalize).ok_or_else(|| {
            StorageError::decode(format!("entity `{id}` of type `{type_name}` has no data"))
        })
    }

    async fn list_entities(&self, type_name: String) -> StorageResult<Vec<EntityId>> {
        self.ensure_open()?;
        Ok(self
            .inner
            .collections
            .get(&type_name)
            .map(|collection| collection.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn entity_exists(&self, type_name: String, id: EntityId) -> StorageResult<bool> {
        self.ensure_open()?;
        Ok(self
            .inner
            .collections
            .get(&type_name)
            .is_some_and(|collection| collection.contains_key(&id)))
    }
}

impl EntityStorage for MemoryEntityStorage {
    fn write(
        &self,
        type_name: &str,
        id: &EntityId,
        data: &Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (type_name, id, data) = (type_name.to_owned(), id.clone(), encode(data));
        Box::pin(async move { store.write_entity(type_name, id, data).await })
    }

    fn read(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<Value>> {
        let store = self.clone();
        let (type_name, id) = (type_name.to_owned(), id.clone());
        Box::pin(async move { store.read_entity(type_name, id).await })
    }

    fn list(&self, type_name: &str) -> BoxFuture<'static, StorageResult<Vec<EntityId>>> {
        let store = self.clone();
        let type_name = type_name.to_owned();
        Box::pin(async move { store.list_entities(type_name).await })
    }

    fn exists(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let (type_name, id) = (type_name.to_owned(), id.clone());
        Box::pin(async move { store.entity_exists(type_name, id).await })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_open() })
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let store = self.clone();
        Box::pin(async move { store.inner.closed.store(true, Ordering::Release) })
    }
}
