use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KeyedStore, StagedWrite, StoreError};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    writes: Vec<StagedWrite>,
    pipelines: usize,
    reads: usize,
    unavailable: bool,
}

/// Process-local [`KeyedStore`].
///
/// Expiry follows the tokio clock so paused-time tests can age keys out. Every write
/// is also appended to a log that tests inspect through [`InMemoryStore::writes`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// All writes applied so far, in order.
    pub async fn writes(&self) -> Vec<StagedWrite> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn writes_for(&self, key: &str) -> Vec<StagedWrite> {
        self.inner
            .lock()
            .await
            .writes
            .iter()
            .filter(|write| write.key == key)
            .cloned()
            .collect()
    }

    /// Number of `set_many` round trips.
    pub async fn pipeline_count(&self) -> usize {
        self.inner.lock().await.pipelines
    }

    /// Number of read round trips (`get`, `get_many`, `exists`).
    pub async fn read_count(&self) -> usize {
        self.inner.lock().await.reads
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl Inner {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    fn apply(&mut self, write: StagedWrite, now: Instant) {
        self.entries.insert(
            write.key.clone(),
            Entry {
                value: write.value.clone(),
                // A TTL past the end of the clock means the key never expires.
                expires_at: write.ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );
        self.writes.push(write);
    }
}

#[async_trait]
impl KeyedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.reads += 1;
        Ok(inner.lookup(key, Instant::now()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.reads += 1;
        let now = Instant::now();
        Ok(keys.iter().map(|key| inner.lookup(key, now)).collect())
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.apply(
            StagedWrite {
                key: key.to_string(),
                value,
                ttl,
            },
            Instant::now(),
        );
        Ok(())
    }

    async fn set_many(&self, writes: Vec<StagedWrite>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.pipelines += 1;
        let now = Instant::now();
        for write in writes {
            inner.apply(write, now);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        inner.reads += 1;
        Ok(inner.lookup(key, Instant::now()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn keys_expire_with_the_tokio_clock() {
        time::pause();

        let store = InMemoryStore::new();
        store
            .set("rate", "0.5".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store.exists("rate").await.unwrap());

        time::advance(Duration::from_secs(61)).await;

        assert_eq!(store.get("rate").await.unwrap(), None);
        assert!(!store.exists("rate").await.unwrap());
    }

    #[tokio::test]
    async fn oversized_ttl_keeps_the_key() {
        let store = InMemoryStore::new();
        store.set("rate", "0.5".to_string(), Some(Duration::MAX)).await.unwrap();

        assert_eq!(store.get("rate").await.unwrap().as_deref(), Some("0.5"));
        assert_eq!(store.ttl("rate").await, None);
        assert_eq!(store.writes().await[0].ttl, Some(Duration::MAX));
    }

    #[tokio::test]
    async fn get_many_is_index_aligned() {
        let store = InMemoryStore::new();
        store.set("b", "2".to_string(), None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let values = store.get_many(&keys).await.unwrap();

        assert_eq!(values, vec![None, Some("2".to_string())]);
        assert_eq!(store.read_count().await, 1);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_calls() {
        let store = InMemoryStore::new();
        store.set_unavailable(true).await;

        let err = store.get("a").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(store.writes().await.is_empty());
    }
}
