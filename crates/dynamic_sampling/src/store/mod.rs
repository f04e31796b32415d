//! Keyed storage with expiry, the only shared state between task runs.

mod memory;
mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

pub use self::memory::InMemoryStore;
pub use self::redis_backend::RedisStore;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The Redis server rejected a command or the connection dropped.
    #[snafu(display("Redis command failed: {source}"))]
    Redis { source: ::redis::RedisError },

    /// The backend refused to serve the request.
    #[snafu(display("Store backend unavailable: {reason}"))]
    Unavailable { reason: String },

    #[snafu(display("Failed to encode value for key {key}: {source}"))]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

/// A single write waiting in a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct StagedWrite {
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
}

/// String-keyed store with optional per-key expiry.
///
/// Writes are plain overwrites; there are no transactions or compare-and-swap. Two
/// writers racing on a key converge to whichever wrote last.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads many keys in one round trip. The result is index-aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Applies every write in one pipelined, non-transactional round trip.
    ///
    /// Writes become visible together from the caller's point of view but a reader may
    /// observe a prefix of them.
    async fn set_many(&self, writes: Vec<StagedWrite>) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Collects writes and sends them to a [`KeyedStore`] in one pipeline.
#[derive(Debug, Default)]
pub struct WriteBatch {
    writes: Vec<StagedWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        self.writes.push(StagedWrite {
            key: key.into(),
            value: value.into(),
            ttl,
        });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Sends the staged writes. An empty batch costs no round trip.
    pub async fn commit<S>(self, store: &S) -> Result<usize, StoreError>
    where
        S: KeyedStore + ?Sized,
    {
        let staged = self.writes.len();
        if staged == 0 {
            return Ok(0);
        }
        store.set_many(self.writes).await?;
        Ok(staged)
    }
}
