//! Flat string-keyed store with point lookups and half-open range scans.

mod memory;
mod mongodb;

pub use self::memory::MemoryKvEngine;
pub use self::mongodb::MongoKvEngine;

use futures::future::BoxFuture;

use crate::dao::{
    models::KvItem,
    storage::{StorageError, StorageResult},
};

/// Abstraction over the key-value persistence backend.
pub trait KvEngine: Send + Sync {
    /// Upsert `value` under `key`; last write wins.
    fn put(&self, key: &str, value: &str) -> BoxFuture<'static, StorageResult<()>>;

    /// Look `key` up. A missing key yields an empty string, not an error.
    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<String>>;

    /// Open an ascending cursor over keys in `[begin, end)`.
    fn find(
        &self,
        begin: &str,
        end: &str,
    ) -> BoxFuture<'static, StorageResult<Box<dyn KvIterator>>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;

    /// Release the underlying connection. No operation may be in flight.
    fn close(&self) -> BoxFuture<'static, ()>;

    /// Whether `err` should drive the caller's reconnect logic.
    fn is_connection_error(&self, err: &StorageError) -> bool {
        err.is_connection_error()
    }
}

/// Lazy, forward-only sequence of [`KvItem`]s.
///
/// The end of the sequence is reported as [`StorageError::Exhausted`]; the cursor is released at
/// that point and any further call fails with [`StorageError::IteratorClosed`].
pub trait KvIterator: Send {
    fn next(&mut self) -> BoxFuture<'_, StorageResult<KvItem>>;
}

/// Drain an iterator into a vector, stopping cleanly at exhaustion.
pub async fn collect_items(iterator: &mut dyn KvIterator) -> StorageResult<Vec<KvItem>> {
    let mut items = Vec::new();
    loop {
        match iterator.next().await {
            Ok(item) => items.push(item),
            Err(err) if err.is_exhausted() => return Ok(items),
            Err(err) => return Err(err),
        }
    }
}
