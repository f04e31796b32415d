use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::detector::{TrendPayload, TrendState};
use super::ProjectId;
use crate::store::{EncodeSnafu, KeyedStore, StoreError, WriteBatch};

const KEY_PREFIX: &str = "statdtr";
const STATE_VERSION: u32 = 1;

/// What kind of entity a detector tracks. Each kind has its own key space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Transaction,
    Function,
}

impl DetectorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Transaction => "transaction",
            DetectorKind::Function => "function",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TrendStoreSettings {
    pub kind: DetectorKind,
    /// Entities that stop reporting are forgotten once this elapses.
    pub ttl: Duration,
}

impl Default for TrendStoreSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Transaction,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTrendState {
    #[serde(rename = "V")]
    version: u32,
    /// Unix seconds of the last applied reading.
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    timestamp_secs: Option<i64>,
    /// Sub-second part of `T`. Kept so ordering checks see the exact stored instant.
    #[serde(rename = "N", default, skip_serializing_if = "is_zero")]
    timestamp_nanos: u32,
    #[serde(rename = "C")]
    count: u64,
    #[serde(rename = "S")]
    short_ma: f64,
    #[serde(rename = "L")]
    long_ma: f64,
}

impl From<&TrendState> for StoredTrendState {
    fn from(state: &TrendState) -> Self {
        Self {
            version: STATE_VERSION,
            timestamp_secs: state.timestamp.map(|ts| ts.timestamp()),
            timestamp_nanos: state.timestamp.map_or(0, |ts| ts.timestamp_subsec_nanos()),
            count: state.count,
            short_ma: state.short_ma,
            long_ma: state.long_ma,
        }
    }
}

/// Reads and writes [`TrendState`]s in bulk, one key per project and entity.
pub struct TrendStateStore<S: ?Sized> {
    store: Arc<S>,
    settings: TrendStoreSettings,
}

impl<S: ?Sized> Clone for TrendStateStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            settings: self.settings,
        }
    }
}

impl<S> TrendStateStore<S>
where
    S: KeyedStore + ?Sized,
{
    pub fn new(store: Arc<S>, settings: TrendStoreSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &TrendStoreSettings {
        &self.settings
    }

    pub fn cache_key(&self, project_id: ProjectId, group: &str) -> String {
        format!(
            "{KEY_PREFIX}:v{STATE_VERSION}:{}:p:{project_id}:{group}",
            self.settings.kind.as_str()
        )
    }

    /// One state per payload, index-aligned. Missing or unreadable entries come back
    /// as the default (never seen) state.
    pub async fn bulk_read_states(
        &self,
        project_id: ProjectId,
        payloads: &[TrendPayload],
    ) -> Result<Vec<TrendState>, StoreError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = payloads
            .iter()
            .map(|payload| self.cache_key(project_id, &payload.group))
            .collect();
        let values = self.store.get_many(&keys).await?;

        Ok(keys
            .iter()
            .zip(values)
            .map(|(key, value)| value.and_then(|raw| decode_state(key, &raw)).unwrap_or_default())
            .collect())
    }

    /// Writes every `Some` state; `None` leaves the stored value for that payload alone.
    ///
    /// Returns how many states were written.
    pub async fn bulk_write_states(
        &self,
        project_id: ProjectId,
        payloads: &[TrendPayload],
        states: &[Option<TrendState>],
    ) -> Result<usize, StoreError> {
        let mut batch = WriteBatch::new();
        for (payload, state) in payloads.iter().zip(states) {
            let Some(state) = state else { continue };
            let key = self.cache_key(project_id, &payload.group);
            let value = serde_json::to_string(&StoredTrendState::from(state)).context(EncodeSnafu { key: key.clone() })?;
            batch.stage(key, value, Some(self.settings.ttl));
        }
        batch.commit(self.store.as_ref()).await
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn decode_state(key: &str, raw: &str) -> Option<TrendState> {
    let stored: StoredTrendState = match serde_json::from_str(raw) {
        Ok(stored) => stored,
        Err(error) => {
            warn!(target: "dynamic_sampling::trends", %key, %error, "Discarding undecodable trend state");
            return None;
        }
    };

    if stored.version != STATE_VERSION {
        warn!(target: "dynamic_sampling::trends", %key, version = stored.version, "Discarding trend state with unknown version");
        return None;
    }

    let timestamp = match stored.timestamp_secs {
        Some(secs) => match DateTime::from_timestamp(secs, stored.timestamp_nanos) {
            Some(ts) => Some(ts),
            None => {
                warn!(
                    target: "dynamic_sampling::trends",
                    %key,
                    timestamp_secs = secs,
                    timestamp_nanos = stored.timestamp_nanos,
                    "Discarding trend state with out-of-range timestamp"
                );
                return None;
            }
        },
        None => None,
    };

    Some(TrendState {
        timestamp,
        count: stored.count,
        short_ma: stored.short_ma,
        long_ma: stored.long_ma,
    })
}
