//! Partitioned key-value storage.
//!
//! The core only needs single-key reads and writes, write-if-absent, and an
//! ordered range scan over sub-keys. [`KvStore`] is that interface; one
//! instance backs one partition. Values are JSON.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

pub mod memory;
pub mod postgres;
pub mod queries;

pub use memory::MemoryStore;
pub use postgres::{init_pool, DbPool, PostgresStore};

/// Logical table a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Space {
    Vehicle,
    Rider,
    EmailIndex,
    ActiveRide,
    LocationHistory,
    RideHistory,
}

impl Space {
    pub fn as_str(self) -> &'static str {
        match self {
            Space::Vehicle => "vehicle",
            Space::Rider => "rider",
            Space::EmailIndex => "email_index",
            Space::ActiveRide => "active_ride",
            Space::LocationHistory => "location_history",
            Space::RideHistory => "ride_history",
        }
    }
}

/// `(space, id, sub)`. Plain records use an empty sub-key; collections such as
/// location history and ride history store one entry per sub-key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub space: Space,
    pub id: String,
    pub sub: String,
}

impl Key {
    pub fn new(space: Space, id: &str) -> Self {
        Self {
            space,
            id: id.to_string(),
            sub: String::new(),
        }
    }

    pub fn sub(space: Space, id: &str, sub: &str) -> Self {
        Self {
            space,
            id: id.to_string(),
            sub: sub.to_string(),
        }
    }
}

/// Sub-key for a millisecond timestamp; zero padding keeps byte order equal to numeric order.
pub fn timestamp_sub_key(timestamp: i64) -> String {
    format!("{:020}", timestamp.max(0))
}

/// Storage for a single partition. Each call is atomic for its key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: Key) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>>;

    /// Writes only if nothing is stored under `key`. Returns whether it wrote.
    fn put_if_absent(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<bool, StoreError>>;

    fn put(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>>;

    fn delete(&self, key: Key) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Entries of `(space, id)` with `from <= sub < to`, ascending by sub-key.
    fn range(
        &self,
        space: Space,
        id: String,
        from: String,
        to: String,
    ) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>, StoreError>>;
}

pub async fn read<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: Key,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn write<T: Serialize>(store: &dyn KvStore, key: Key, value: &T) -> Result<(), StoreError> {
    store.put(key, serde_json::to_vec(value)?).await
}

pub async fn write_if_absent<T: Serialize>(
    store: &dyn KvStore,
    key: Key,
    value: &T,
) -> Result<bool, StoreError> {
    store.put_if_absent(key, serde_json::to_vec(value)?).await
}

pub async fn read_range<T: DeserializeOwned>(
    store: &dyn KvStore,
    space: Space,
    id: &str,
    from: String,
    to: String,
) -> Result<Vec<T>, StoreError> {
    store
        .range(space, id.to_string(), from, to)
        .await?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StoreError::from))
        .collect()
}

/// Every entry of the collection stored under `(space, id)`.
pub async fn read_all<T: DeserializeOwned>(
    store: &dyn KvStore,
    space: Space,
    id: &str,
) -> Result<Vec<T>, StoreError> {
    // Sub-keys are never empty for collections, and no printable sub-key sorts after U+10FFFF.
    read_range(store, space, id, "\u{1}".to_string(), char::MAX.to_string()).await
}

/// Stable partition for a routing key, identical across processes.
pub fn partition_of(routing_key: &str, partition_count: usize) -> usize {
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, routing_key.as_bytes()).as_u128();
    (hash % partition_count.max(1) as u128) as usize
}

/// One store per partition, addressed by routing key.
#[derive(Clone)]
pub struct PartitionedStore {
    shards: Vec<Arc<dyn KvStore>>,
}

impl PartitionedStore {
    pub fn new(shards: Vec<Arc<dyn KvStore>>) -> Self {
        Self { shards }
    }

    /// `partition_count` independent in-memory shards.
    pub fn in_memory(partition_count: usize) -> Self {
        Self::new(
            (0..partition_count.max(1))
                .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn KvStore>)
                .collect(),
        )
    }

    pub fn partition_count(&self) -> usize {
        self.shards.len()
    }

    pub fn partition_of(&self, routing_key: &str) -> usize {
        partition_of(routing_key, self.shards.len())
    }

    pub fn shard(&self, partition: usize) -> Arc<dyn KvStore> {
        self.shards[partition].clone()
    }

    pub fn shard_for(&self, routing_key: &str) -> Arc<dyn KvStore> {
        self.shard(self.partition_of(routing_key))
    }
}
