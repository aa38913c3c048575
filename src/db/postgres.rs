use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};

use super::{queries, Key, KvStore, Space};
use crate::error::StoreError;

pub type DbPool = Pool<Postgres>;

pub async fn init_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .connect(database_url)
        .await?;
    sqlx::query(queries::CREATE_KV_ENTRIES).execute(&pool).await?;
    Ok(pool)
}

/// One partition's view of the shared `kv_entries` table.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: DbPool,
    partition: i32,
}

impl PostgresStore {
    pub fn new(pool: DbPool, partition: i32) -> Self {
        Self { pool, partition }
    }

    async fn fetch(&self, key: Key) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(queries::SELECT_ENTRY)
            .bind(self.partition)
            .bind(key.space.as_str())
            .bind(&key.id)
            .bind(&key.sub)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("value")?)),
            None => Ok(None),
        }
    }

    async fn execute(&self, sql: &'static str, key: Key, value: Option<Vec<u8>>) -> Result<u64, StoreError> {
        let mut query = sqlx::query(sql)
            .bind(self.partition)
            .bind(key.space.as_str())
            .bind(key.id)
            .bind(key.sub);
        if let Some(value) = value {
            query = query.bind(value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn scan(
        &self,
        space: Space,
        id: String,
        from: String,
        to: String,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let rows = sqlx::query(queries::SELECT_SUB_KEY_RANGE)
            .bind(self.partition)
            .bind(space.as_str())
            .bind(id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push((
                row.try_get::<String, _>("sub_key")?,
                row.try_get::<Vec<u8>, _>("value")?,
            ));
        }
        Ok(entries)
    }
}

impl KvStore for PostgresStore {
    fn get(&self, key: Key) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(self.fetch(key))
    }

    fn put_if_absent(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            self.execute(queries::INSERT_ENTRY_IF_ABSENT, key, Some(value))
                .await
                .map(|written| written == 1)
        })
    }

    fn put(&self, key: Key, value: Vec<u8>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.execute(queries::UPSERT_ENTRY, key, Some(value))
                .await
                .map(|_| ())
        })
    }

    fn delete(&self, key: Key) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.execute(queries::DELETE_ENTRY, key, None).await.map(|_| ()) })
    }

    fn range(
        &self,
        space: Space,
        id: String,
        from: String,
        to: String,
    ) -> BoxFuture<'_, Result<Vec<(String, Vec<u8>)>, StoreError>> {
        Box::pin(self.scan(space, id, from, to))
    }
}
