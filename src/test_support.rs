//! Store wrappers for exercising failure paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::db::{Key, KvStore, MemoryStore, PartitionedStore, Space};
use crate::error::StoreError;
use crate::processor::Clock;

/// A wall clock stuck at one millisecond.
pub struct FrozenClock(pub i64);

impl Clock for FrozenClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// A [`MemoryStore`] whose writes or deletes in chosen spaces fail a set number of times.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    put_faults: Mutex<HashMap<Space, u32>>,
    delete_faults: Mutex<HashMap<Space, u32>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// The next `times` writes to `space` fail.
    pub fn fail_puts(&self, space: Space, times: u32) {
        if let Ok(mut faults) = self.put_faults.lock() {
            faults.insert(space, times);
        }
    }

    /// The next `times` deletes in `space` fail.
    pub fn fail_deletes(&self, space: Space, times: u32) {
        if let Ok(mut faults) = self.delete_faults.lock() {
            faults.insert(space, times);
        }
    }

    pub fn pending_delete_faults(&self, space: Space) -> u32 {
        self.delete_faults
            .lock()
            .map(|faults| faults.get(&space).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn trip(faults: &Mutex<HashMap<Space, u32>>, key: &Key, op: &str) -> Result<(), StoreError> {
        let Ok(mut faults) = faults.lock() else {
            return Ok(());
        };
        match faults.get_mut(&key.space) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::Injected(format!(
                    "{} {}/{}",
                    op,
                    key.space.as_str(),
                    key.id
                )))
            }
            _ => Ok(()),
        }
    }
}

impl KvStore for FaultyStore {
    fn get(&self, key: Key) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>> {
        self.inner.get(key)
    }

    fn put_if_absent(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<bool, StoreError>> {
        if let Err(e) = Self::trip(&self.put_faults, &key, "put") {
            return Box::pin(async move { Err(e) });
        }
        self.inner.put_if_absent(key, value)
    }

    fn put(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>> {
        if let Err(e) = Self::trip(&self.put_faults, &key, "put") {
            return Box::pin(async move { Err(e) });
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: Key) -> BoxFuture<'_, Result<(), StoreError>> {
        if let Err(e) = Self::trip(&self.delete_faults, &key, "delete") {
            return Box::pin(async move { Err(e) });
        }
        self.inner.delete(key)
    }

    fn range(
        &self,
        space: Space,
        id: String,
        from: String,
        to: String,
    ) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        self.inner.range(space, id, from, to)
    }
}

/// `partition_count` faulty shards, returned alongside the store built from them.
pub fn faulty_shards(partition_count: usize) -> (PartitionedStore, Vec<Arc<FaultyStore>>) {
    let shards: Vec<Arc<FaultyStore>> = (0..partition_count)
        .map(|_| Arc::new(FaultyStore::new()))
        .collect();
    let store = PartitionedStore::new(
        shards
            .iter()
            .map(|s| s.clone() as Arc<dyn KvStore>)
            .collect(),
    );
    (store, shards)
}

/// `partition_count` in-memory shards, kept inspectable.
pub fn memory_shards(partition_count: usize) -> (PartitionedStore, Vec<Arc<MemoryStore>>) {
    let shards: Vec<Arc<MemoryStore>> = (0..partition_count)
        .map(|_| Arc::new(MemoryStore::new()))
        .collect();
    let store = PartitionedStore::new(
        shards
            .iter()
            .map(|s| s.clone() as Arc<dyn KvStore>)
            .collect(),
    );
    (store, shards)
}
