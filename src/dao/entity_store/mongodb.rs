use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection,
    bson::{Bson, Document, doc},
};
use serde_json::Value;

use super::{DATA_FIELD, EntityStorage};
use crate::dao::{
    models::EntityId,
    mongodb::{MongoConfig, MongoConnection, MongoDaoError, MongoResult},
    normalize::{encode, normalize},
    storage::StorageResult,
};

/// MongoDB-backed [`EntityStorage`]; the type name is the collection name.
#[derive(Clone)]
pub struct MongoEntityStorage {
    connection: MongoConnection,
}

impl MongoEntityStorage {
    /// Connect to MongoDB using `config`.
    pub async fn open(config: &MongoConfig) -> MongoResult<Self> {
        let connection = MongoConnection::connect(config).await?;
        Ok(Self::with_connection(connection))
    }

    pub fn with_connection(connection: MongoConnection) -> Self {
        Self { connection }
    }

    fn collection(&self, type_name: &str) -> Collection<Document> {
        self.connection.collection(type_name)
    }

    async fn write_entity(&self, type_name: String, id: EntityId, data: Bson) -> MongoResult<()> {
        let mut fields = Document::new();
        fields.insert(DATA_FIELD, data);

        self.collection(&type_name)
            .update_one(doc! {"_id": id.as_str()}, doc! {"$set": fields})
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::WriteEntity {
                type_name,
                id: id.into_string(),
                source,
            })?;

        Ok(())
    }

    async fn read_entity(&self, type_name: String, id: EntityId) -> MongoResult<Value> {
        let document = self
            .collection(&type_name)
            .find_one(doc! {"_id": id.as_str()})
            .projection(doc! {"data": 1})
            .await
            .map_err(|source| MongoDaoError::ReadEntity {
                type_name: type_name.clone(),
                id: id.to_string(),
                source,
            })?;

        let Some(mut document) = document else {
            return Err(MongoDaoError::EntityNotFound {
                type_name,
                id: id.into_string(),
            });
        };

        document
            .remove(DATA_FIELD)
            .map(normalize)
            .ok_or_else(|| MongoDaoError::MissingField {
                collection: type_name,
                id: id.into_string(),
                field: DATA_FIELD,
            })
    }

    async fn list_entities(&self, type_name: String) -> MongoResult<Vec<EntityId>> {
        let documents: Vec<Document> = self
            .collection(&type_name)
            .find(doc! {})
            .projection(doc! {"_id": 1})
            .await
            .map_err(|source| MongoDaoError::ListEntities {
                type_name: type_name.clone(),
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListEntities { type_name, source })?;

        // Documents whose `_id` is not a string were not written by this store.
        Ok(documents
            .into_iter()
            .filter_map(|mut document| match document.remove("_id") {
                Some(Bson::String(id)) => Some(EntityId::from(id)),
                _ => None,
            })
            .collect())
    }

    async fn entity_exists(&self, type_name: String, id: EntityId) -> MongoResult<bool> {
        let count = self
            .collection(&type_name)
            .count_documents(doc! {"_id": id.as_str()})
            .limit(1)
            .await
            .map_err(|source| MongoDaoError::EntityExists {
                type_name,
                id: id.into_string(),
                source,
            })?;

        Ok(count > 0)
    }
}

impl EntityStorage for MongoEntityStorage {
    fn write(
        &self,
        type_name: &str,
        id: &EntityId,
        data: &Value,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let (type_name, id, data) = (type_name.to_owned(), id.clone(), encode(data));
        Box::pin(async move {
            store
                .write_entity(type_name, id, data)
                .await
                .map_err(Into::into)
        })
    }

    fn read(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<Value>> {
        let store = self.clone();
        let (type_name, id) = (type_name.to_owned(), id.clone());
        Box::pin(async move { store.read_entity(type_name, id).await.map_err(Into::into) })
    }

    fn list(&self, type_name: &str) -> BoxFuture<'static, StorageResult<Vec<EntityId>>> {
        let store = self.clone();
        let type_name = type_name.to_owned();
        Box::pin(async move { store.list_entities(type_name).await.map_err(Into::into) })
    }

    fn exists(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        let (type_name, id) = (type_name.to_owned(), id.clone());
        Box::pin(async move { store.entity_exists(type_name, id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let connection = self.connection.clone();
        Box::pin(async move { connection.ping().await.map_err(Into::into) })
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let connection = self.connection.clone();
        Box::pin(async move { connection.close().await })
    }
}
