use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Cursor,
    bson::{Bson, Document, doc},
};

use super::{KvEngine, KvIterator};
use crate::dao::{
    models::KvItem,
    mongodb::{MongoConfig, MongoConnection, MongoDaoError, MongoResult},
    storage::{StorageError, StorageResult},
};

/// Field holding the value; the key is the document `_id`.
const VALUE_FIELD: &str = "_";

/// MongoDB-backed [`KvEngine`] storing one document per key.
#[derive(Clone)]
pub struct MongoKvEngine {
    connection: MongoConnection,
    collection: Collection<Document>,
}

impl MongoKvEngine {
    /// Connect to MongoDB and bind to the configured key-value collection.
    pub async fn open(config: &MongoConfig) -> MongoResult<Self> {
        let connection = MongoConnection::connect(config).await?;
        Ok(Self::with_connection(connection, &config.kv_collection))
    }

    pub fn with_connection(connection: MongoConnection, collection: &str) -> Self {
        let collection = connection.collection(collection);
        Self {
            connection,
            collection,
        }
    }

    async fn put_value(&self, key: String, value: String) -> MongoResult<()> {
        let mut fields = Document::new();
        fields.insert(VALUE_FIELD, value);

        self.collection
            .update_one(doc! {"_id": key.as_str()}, doc! {"$set": fields})
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Put { key, source })?;

        Ok(())
    }

    async fn get_value(&self, key: String) -> MongoResult<String> {
        let document = self
            .collection
            .find_one(doc! {"_id": key.as_str()})
            .await
            .map_err(|source| MongoDaoError::Get {
                key: key.clone(),
                source,
            })?;

        let Some(document) = document else {
            return Ok(String::new());
        };

        match document.get(VALUE_FIELD) {
            Some(Bson::String(value)) => Ok(value.clone()),
            _ => Err(MongoDaoError::MissingField {
                collection: self.collection.name().to_owned(),
                id: key,
                field: VALUE_FIELD,
            }),
        }
    }

    async fn open_range(&self, begin: String, end: String) -> MongoResult<MongoKvIterator> {
        let cursor = self
            .collection
            .find(doc! {"_id": {"$gte": begin.as_str(), "$lt": end.as_str()}})
            .sort(doc! {"_id": 1})
            .await
            .map_err(|source| MongoDaoError::Find { begin, end, source })?;

        Ok(MongoKvIterator {
            cursor: Some(cursor),
            collection: self.collection.name().to_owned(),
        })
    }
}

impl KvEngine for MongoKvEngine {
    fn put(&self, key: &str, value: &str) -> BoxFuture<'static, StorageResult<()>> {
        let engine = self.clone();
        let (key, value) = (key.to_owned(), value.to_owned());
        Box::pin(async move { engine.put_value(key, value).await.map_err(Into::into) })
    }

    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<String>> {
        let engine = self.clone();
        let key = key.to_owned();
        Box::pin(async move { engine.get_value(key).await.map_err(Into::into) })
    }

    fn find(
        &self,
        begin: &str,
        end: &str,
    ) -> BoxFuture<'static, StorageResult<Box<dyn KvIterator>>> {
        let engine = self.clone();
        let (begin, end) = (begin.to_owned(), end.to_owned());
        Box::pin(async move {
            engine
                .open_range(begin, end)
                .await
                .map(|iterator| Box::new(iterator) as Box<dyn KvIterator>)
                .map_err(Into::into)
        })
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

struct MongoKvIterator {
    // `None` once the cursor has been drained and released.
    cursor: Option<Cursor<Document>>,
    collection: String,
}

impl KvIterator for MongoKvIterator {
    fn next(&mut self) -> BoxFuture<'_, StorageResult<KvItem>> {
        Box::pin(async move {
            let Some(cursor) = self.cursor.as_mut() else {
                return Err(StorageError::IteratorClosed);
            };

            match cursor.try_next().await {
                Ok(Some(document)) => decode_item(&self.collection, document).map_err(Into::into),
                Ok(None) => {
                    self.cursor = None;
                    Err(StorageError::Exhausted)
                }
                Err(source) => Err(MongoDaoError::Cursor { source }.into()),
            }
        })
    }
}

fn decode_item(collection: &str, mut document: Document) -> MongoResult<KvItem> {
    let key = match document.remove("_id") {
        Some(Bson::String(key)) => key,
        _ => {
            return Err(MongoDaoError::MissingField {
                collection: collection.to_owned(),
                id: "<unknown>".to_owned(),
                field: "_id",
            });
        }
    };

    match document.remove(VALUE_FIELD) {
        Some(Bson::String(value)) => Ok(KvItem { key, value }),
        _ => Err(MongoDaoError::MissingField {
            collection: collection.to_owned(),
            id: key,
            field: VALUE_FIELD,
        }),
    }
}
