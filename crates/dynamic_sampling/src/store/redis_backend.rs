use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use snafu::ResultExt;

use super::{KeyedStore, RedisSnafu, StagedWrite, StoreError};

/// [`KeyedStore`] backed by a Redis server.
///
/// Each write with a TTL is sent as `SET` followed by `PEXPIRE` in the same
/// non-transactional pipeline.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).context(RedisSnafu)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context(RedisSnafu)?;
        info!(target: "dynamic_sampling::store", "Connected to Redis");
        Ok(Self { connection })
    }

    fn stage(pipe: &mut redis::Pipeline, key: &str, value: &str, ttl: Option<Duration>) {
        pipe.set(key, value).ignore();
        if let Some(ttl) = ttl {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            pipe.pexpire(key, millis).ignore();
        }
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        Self::stage(&mut pipe, key, &value, ttl);
        let mut conn = self.connection.clone();
        let () = pipe.query_async(&mut conn).await.context(RedisSnafu)?;
        Ok(())
    }

    async fn set_many(&self, writes: Vec<StagedWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for write in &writes {
            Self::stage(&mut pipe, &write.key, &write.value, write.ttl);
        }
        let mut conn = self.connection.clone();
        let () = pipe.query_async(&mut conn).await.context(RedisSnafu)?;
        debug!(target: "dynamic_sampling::store", writes = writes.len(), "Pipeline executed");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let found: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(found)
    }
}
