use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::{Key, KvStore, Space};
use crate::error::StoreError;

/// In-process store backed by an ordered map. Used by the test suite and the
/// `STORE_BACKEND=memory` mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Key, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries of `space`, in key order.
    pub async fn entries(&self, space: Space) -> Vec<(Key, Vec<u8>)> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.space == space)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: Key) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move { Ok(self.entries.read().await.get(&key).cloned()) })
    }

    fn put_if_absent(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                return Ok(false);
            }
            entries.insert(key, value);
            Ok(true)
        })
    }

    fn put(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.write().await.insert(key, value);
            Ok(())
        })
    }

    fn delete(&self, key: Key) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.write().await.remove(&key);
            Ok(())
        })
    }

    fn range(
        &self,
        space: Space,
        id: String,
        from: String,
        to: String,
    ) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        Box::pin(async move {
            if from >= to {
                return Ok(Vec::new());
            }
            let start = Key::sub(space, &id, &from);
            let end = Key::sub(space, &id, &to);
            Ok(self
                .entries
                .read()
                .await
                .range(start..end)
                .map(|(k, v)| (k.sub.clone(), v.clone()))
                .collect())
        })
    }
}
