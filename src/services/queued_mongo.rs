//! MongoDB access for single-threaded callers.
//!
//! Every call becomes a job in one dispatcher group, so the caller never awaits the driver on
//! its own context and all commands reach the server in submission order. Documents coming back
//! are normalized to [`Value`].

use std::{future::Future, sync::Arc};

use futures::TryStreamExt;
use mongodb::{
    IndexModel,
    bson::{Bson, Document, doc},
    error::Error as MongoError,
    options::{FindOneOptions, FindOptions},
};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    dao::{
        mongodb::{MongoConfig, MongoConnection, MongoDaoError},
        normalize::normalize,
        storage::{StorageError, StorageResult},
    },
    services::dispatcher::{AsyncDispatcher, JobHandle},
};

/// Group used when none is given to [`QueuedMongo::new`].
pub const DEFAULT_GROUP: &str = "_mongodb";

/// Handle to a MongoDB session driven through an [`AsyncDispatcher`] group.
///
/// Clones share the same session. Until [`QueuedMongo::dial`] has completed, and again after
/// [`QueuedMongo::close`], every operation fails with [`StorageError::NotConnected`].
#[derive(Clone)]
pub struct QueuedMongo {
    dispatcher: AsyncDispatcher,
    group: Arc<str>,
    session: Arc<RwLock<Option<MongoConnection>>>,
}

impl QueuedMongo {
    pub fn new(dispatcher: AsyncDispatcher) -> Self {
        Self::with_group(dispatcher, DEFAULT_GROUP)
    }

    /// Use a dedicated group, e.g. to keep two databases from serializing behind each other.
    pub fn with_group(dispatcher: AsyncDispatcher, group: &str) -> Self {
        Self {
            dispatcher,
            group: Arc::from(group),
            session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Connect with `config`; replaces any session already open.
    pub fn dial(&self, config: MongoConfig) -> JobHandle<(), StorageError> {
        let session = Arc::clone(&self.session);
        self.dispatcher.enqueue(&self.group, move || async move {
            let connection = MongoConnection::connect(&config).await?;
            let previous = session.write().await.replace(connection);
            if let Some(previous) = previous {
                previous.close().await;
            }
            Ok::<_, StorageError>(())
        })
    }

    /// Shut the session down. Jobs queued behind this one see [`StorageError::NotConnected`].
    pub fn close(&self) -> JobHandle<(), StorageError> {
        let session = Arc::clone(&self.session);
        self.dispatcher.enqueue(&self.group, move || async move {
            let connection = session
                .write()
                .await
                .take()
                .ok_or(StorageError::NotConnected)?;
            connection.close().await;
            Ok::<_, StorageError>(())
        })
    }

    /// Point later operations at another database on the same client.
    pub fn use_database(&self, name: &str) -> JobHandle<(), StorageError> {
        let session = Arc::clone(&self.session);
        let name = name.to_owned();
        self.dispatcher.enqueue(&self.group, move || async move {
            let mut session = session.write().await;
            let switched = session
                .as_ref()
                .ok_or(StorageError::NotConnected)?
                .with_database(&name);
            *session = Some(switched);
            Ok::<_, StorageError>(())
        })
    }

    /// Fetch the document whose `_id` is `id`; `None` when nothing matches.
    pub fn find_id(
        &self,
        collection: &str,
        id: impl Into<Bson>,
        options: Option<FindOneOptions>,
    ) -> JobHandle<Option<Value>, StorageError> {
        let id: Bson = id.into();
        self.find_one(collection, doc! {"_id": id}, options)
    }

    pub fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: Option<FindOneOptions>,
    ) -> JobHandle<Option<Value>, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let found = connection
                .collection(&name)
                .find_one(filter)
                .with_options(options)
                .await
                .map_err(command_failed("find_one", &name))?;
            Ok(found.map(normalize))
        })
    }

    pub fn find_all(
        &self,
        collection: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> JobHandle<Vec<Value>, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let documents: Vec<Document> = connection
                .collection(&name)
                .find(filter)
                .with_options(options)
                .await
                .map_err(command_failed("find", &name))?
                .try_collect()
                .await
                .map_err(command_failed("find", &name))?;
            Ok(documents.into_iter().map(normalize).collect())
        })
    }

    pub fn count(&self, collection: &str, filter: Document) -> JobHandle<u64, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            connection
                .collection(&name)
                .count_documents(filter)
                .await
                .map_err(command_failed("count_documents", &name))
        })
    }

    /// Insert `document`, resolving to its `_id`.
    pub fn insert(&self, collection: &str, document: Document) -> JobHandle<Value, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let inserted = connection
                .collection(&name)
                .insert_one(document)
                .await
                .map_err(command_failed("insert_one", &name))?;
            Ok(normalize(inserted.inserted_id))
        })
    }

    /// Insert `documents`, resolving to their `_id`s in input order.
    pub fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> JobHandle<Vec<Value>, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let inserted = connection
                .collection(&name)
                .insert_many(documents)
                .await
                .map_err(command_failed("insert_many", &name))?;

            let mut ids: Vec<(usize, Bson)> = inserted.inserted_ids.into_iter().collect();
            ids.sort_unstable_by_key(|(index, _)| *index);
            Ok(ids.into_iter().map(|(_, id)| normalize(id)).collect())
        })
    }

    /// Apply `update` to the document with `_id == id`, resolving to the matched count.
    pub fn update_id(
        &self,
        collection: &str,
        id: impl Into<Bson>,
        update: Document,
    ) -> JobHandle<u64, StorageError> {
        let name = collection.to_owned();
        let id: Bson = id.into();
        let filter = doc! {"_id": id};
        self.submit(move |connection| async move {
            let result = connection
                .collection(&name)
                .update_one(filter, update)
                .await
                .map_err(command_failed("update_one", &name))?;
            Ok(result.matched_count)
        })
    }

    /// Apply `update` to the first document matching `filter`.
    pub fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> JobHandle<(), StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            connection
                .collection(&name)
                .update_one(filter, update)
                .await
                .map_err(command_failed("update_one", &name))?;
            Ok(())
        })
    }

    /// Apply `update` to every document matching `filter`, resolving to the modified count.
    pub fn update_all(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> JobHandle<u64, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let result = connection
                .collection(&name)
                .update_many(filter, update)
                .await
                .map_err(command_failed("update_many", &name))?;
            Ok(result.modified_count)
        })
    }

    /// `$set` `fields` on the document with `_id == id`, inserting it when absent.
    ///
    /// Resolves to the new `_id` when a document was inserted, `None` when one was updated.
    pub fn upsert_id(
        &self,
        collection: &str,
        id: impl Into<Bson>,
        fields: Document,
    ) -> JobHandle<Option<Value>, StorageError> {
        let id: Bson = id.into();
        self.upsert(collection, doc! {"_id": id}, fields)
    }

    /// `$set` `fields` on the first document matching `filter`, inserting one when none does.
    pub fn upsert(
        &self,
        collection: &str,
        filter: Document,
        fields: Document,
    ) -> JobHandle<Option<Value>, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let result = connection
                .collection(&name)
                .update_one(filter, doc! {"$set": fields})
                .upsert(true)
                .await
                .map_err(command_failed("upsert", &name))?;
            Ok(result.upserted_id.map(normalize))
        })
    }

    pub fn remove_id(&self, collection: &str, id: impl Into<Bson>) -> JobHandle<u64, StorageError> {
        let id: Bson = id.into();
        self.remove(collection, doc! {"_id": id})
    }

    /// Delete the first document matching `filter`, resolving to the deleted count.
    pub fn remove(&self, collection: &str, filter: Document) -> JobHandle<u64, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let result = connection
                .collection(&name)
                .delete_one(filter)
                .await
                .map_err(command_failed("delete_one", &name))?;
            Ok(result.deleted_count)
        })
    }

    pub fn remove_all(&self, collection: &str, filter: Document) -> JobHandle<u64, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let result = connection
                .collection(&name)
                .delete_many(filter)
                .await
                .map_err(command_failed("delete_many", &name))?;
            Ok(result.deleted_count)
        })
    }

    /// Create the index described by `model`, resolving to its name.
    pub fn ensure_index(
        &self,
        collection: &str,
        model: IndexModel,
    ) -> JobHandle<String, StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            let created = connection
                .collection(&name)
                .create_index(model)
                .await
                .map_err(command_failed("create_index", &name))?;
            Ok(created.index_name)
        })
    }

    /// Create a plain index over `keys`, e.g. `doc! {"level": 1, "name": -1}`.
    pub fn ensure_index_key(
        &self,
        collection: &str,
        keys: Document,
    ) -> JobHandle<String, StorageError> {
        self.ensure_index(collection, IndexModel::builder().keys(keys).build())
    }

    pub fn drop_index(&self, collection: &str, index_name: &str) -> JobHandle<(), StorageError> {
        let name = collection.to_owned();
        let index_name = index_name.to_owned();
        self.submit(move |connection| async move {
            connection
                .collection(&name)
                .drop_index(index_name)
                .await
                .map_err(command_failed("drop_index", &name))
        })
    }

    pub fn drop_collection(&self, collection: &str) -> JobHandle<(), StorageError> {
        let name = collection.to_owned();
        self.submit(move |connection| async move {
            connection
                .collection(&name)
                .drop()
                .await
                .map_err(command_failed("drop_collection", &name))
        })
    }

    pub fn drop_database(&self) -> JobHandle<(), StorageError> {
        self.submit(move |connection| async move {
            let database = connection.database();
            database
                .drop()
                .await
                .map_err(command_failed("drop_database", database.name()))
        })
    }

    /// Queue `operation` against the current session.
    ///
    /// The session is looked up when the job runs, so a `dial` queued earlier is visible.
    fn submit<T, F, Fut>(&self, operation: F) -> JobHandle<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(MongoConnection) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<T>> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        self.dispatcher.enqueue(&self.group, move || async move {
            let connection = session
                .read()
                .await
                .clone()
                .ok_or(StorageError::NotConnected)?;
            operation(connection).await
        })
    }
}

fn command_failed(
    operation: &'static str,
    collection: &str,
) -> impl FnOnce(MongoError) -> StorageError {
    let collection = collection.to_owned();
    move |source| {
        StorageError::from(MongoDaoError::Command {
            operation,
            collection,
            source,
        })
    }
}
