//! Per-type entity persistence: one collection per type name, one document per entity.

mod memory;
mod mongodb;

pub use self::memory::MemoryEntityStorage;
pub use self::mongodb::MongoEntityStorage;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::dao::{
    models::{EntityId, EntityRecord},
    storage::{StorageError, StorageResult},
};

/// Field holding the whole entity state inside its document.
pub(crate) const DATA_FIELD: &str = "data";

/// Abstraction over the entity persistence backend.
///
/// Entity state is always written and read as a whole; there are no partial updates.
pub trait EntityStorage: Send + Sync {
    /// Replace the stored state of `(type_name, id)`, creating it when absent.
    fn write(
        &self,
        type_name: &str,
        id: &EntityId,
        data: &Value,
    ) -> BoxFuture<'static, StorageResult<()>>;

    /// Load the normalized state of `(type_name, id)`.
    ///
    /// Fails with [`StorageError::NotFound`] when the entity does not exist.
    fn read(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<Value>>;

    /// List every entity id stored under `type_name`, in no particular order.
    fn list(&self, type_name: &str) -> BoxFuture<'static, StorageResult<Vec<EntityId>>>;

    fn exists(&self, type_name: &str, id: &EntityId) -> BoxFuture<'static, StorageResult<bool>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;

    /// Release the underlying connection. No operation may be in flight.
    fn close(&self) -> BoxFuture<'static, ()>;

    /// Whether `err` means the connection was closed underneath the caller.
    fn is_eof(&self, err: &StorageError) -> bool {
        err.is_eof()
    }

    /// Same as [`EntityStorage::read`], packaged with its identity.
    fn read_record(
        &self,
        type_name: &str,
        id: &EntityId,
    ) -> BoxFuture<'static, StorageResult<EntityRecord>> {
        let read = self.read(type_name, id);
        let (type_name, id) = (type_name.to_owned(), id.clone());
        Box::pin(async move {
            read.await.map(|data| EntityRecord {
                id,
                type_name,
                data,
            })
        })
    }
}
