use std::{
    collections::{BTreeMap, VecDeque},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::{KvEngine, KvIterator};
use crate::dao::{
    models::KvItem,
    storage::{StorageError, StorageResult},
};

/// In-process [`KvEngine`] keeping items ordered by key.
#[derive(Clone, Default)]
pub struct MemoryKvEngine {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    items: RwLock<BTreeMap<String, String>>,
    closed: AtomicBool,
}

impl MemoryKvEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed());
        }
        Ok(())
    }

    async fn put_value(&self, key: String, value: String) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.items.write().await.insert(key, value);
        Ok(())
    }

    async fn get_value(&self, key: String) -> StorageResult<String> {
        self.ensure_open()?;
        let items = self.inner.items.read().await;
        Ok(items.get(&key).cloned().unwrap_or_default())
    }

    async fn open_range(&self, begin: String, end: String) -> StorageResult<MemoryKvIterator> {
        self.ensure_open()?;
        if begin >= end {
            return Ok(MemoryKvIterator {
                items: Some(VecDeque::new()),
            });
        }

        let items = self.inner.items.read().await;
        let snapshot = items
            .range::<str, _>((Bound::Included(begin.as_str()), Bound::Excluded(end.as_str())))
            .map(|(key, value)| KvItem::new(key.as_str(), value.as_str()))
            .collect();

        Ok(MemoryKvIterator {
            items: Some(snapshot),
        })
    }
}

impl KvEngine for MemoryKvEngine {
    fn put(&self, key: &str, value: &str) -> BoxFuture<'static, StorageResult<()>> {
        let engine = self.clone();
        let (key, value) = (key.to_owned(), value.to_owned());
        Box::pin(async move { engine.put_value(key, value).await })
    }

    fn get(&self, key: &str) -> BoxFuture<'static, StorageResult<String>> {
        let engine = self.clone();
        let key = key.to_owned();
        Box::pin(async move { engine.get_value(key).await })
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
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let engine = self.clone();
        Box::pin(async move { engine.ensure_open() })
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        Box::pin(async move { engine.inner.closed.store(true, Ordering::Release) })
    }
}

/// Iterator over a snapshot taken when the range was opened.
struct MemoryKvIterator {
    items: Option<VecDeque<KvItem>>,
}

impl KvIterator for MemoryKvIterator {
    fn next(&mut self) -> BoxFuture<'_, StorageResult<KvItem>> {
        let result = match self.items.as_mut() {
            None => Err(StorageError::IteratorClosed),
            Some(items) => match items.pop_front() {
                Some(item) => Ok(item),
                None => {
                    self.items = None;
                    Err(StorageError::Exhausted)
                }
            },
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::kvdb::collect_items;

    async fn seeded(pairs: &[(&str, &str)]) -> MemoryKvEngine {
        let engine = MemoryKvEngine::new();
        for (key, value) in pairs {
            engine.put(key, value).await.unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn missing_key_reads_as_empty_value() {
        let engine = MemoryKvEngine::new();
        assert_eq!(engine.get("nobody").await.unwrap(), "");
    }

    #[tokio::test]
    async fn put_then_get_returns_latest_value() {
        let engine = seeded(&[("k", "v1")]).await;
        assert_eq!(engine.get("k").await.unwrap(), "v1");

        engine.put("k", "v2").await.unwrap();
        assert_eq!(engine.get("k").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn find_is_half_open_and_ascending() {
        let engine = seeded(&[("c", "3"), ("a", "1"), ("b", "2")]).await;

        let mut iterator = engine.find("a", "c").await.unwrap();
        assert_eq!(iterator.next().await.unwrap(), KvItem::new("a", "1"));
        assert_eq!(iterator.next().await.unwrap(), KvItem::new("b", "2"));
        assert!(iterator.next().await.unwrap_err().is_exhausted());
    }

    #[tokio::test]
    async fn next_after_exhaustion_does_not_repeat() {
        let engine = seeded(&[("a", "1")]).await;
        let mut iterator = engine.find("a", "z").await.unwrap();

        iterator.next().await.unwrap();
        assert!(iterator.next().await.unwrap_err().is_exhausted());
        assert!(matches!(
            iterator.next().await.unwrap_err(),
            StorageError::IteratorClosed
        ));
    }

    #[tokio::test]
    async fn inverted_or_empty_range_yields_nothing() {
        let engine = seeded(&[("a", "1"), ("b", "2")]).await;

        let mut inverted = engine.find("b", "a").await.unwrap();
        assert!(collect_items(inverted.as_mut()).await.unwrap().is_empty());

        let mut empty = engine.find("b", "b").await.unwrap();
        assert!(collect_items(empty.as_mut()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn range_uses_byte_order() {
        let engine = seeded(&[("a10", "x"), ("a2", "y"), ("B", "z")]).await;
        let mut iterator = engine.find("A", "b").await.unwrap();
        let keys: Vec<String> = collect_items(iterator.as_mut())
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, ["B", "a10", "a2"]);
    }

    #[tokio::test]
    async fn operations_after_close_are_connection_errors() {
        let engine = seeded(&[("a", "1")]).await;
        engine.close().await;

        let err = engine.get("a").await.unwrap_err();
        assert!(engine.is_connection_error(&err));
        assert!(engine.health_check().await.is_err());
    }
}
