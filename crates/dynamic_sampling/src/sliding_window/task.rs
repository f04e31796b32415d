use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::OrgId;
use super::rate::{SamplingTierSource, compute_guarded_sliding_window_sample_rate};
use super::settings::SlidingWindowSettings;
use super::volumes::{ActiveOrgVolumes, OrgVolume, VolumeQuery, VolumeSource};
use crate::clock::Clock;
use crate::internal_event::{InternalEvent, SampleRateSkipped, SampleRateWritten, TaskCompleted, TaskTimedOut};
use crate::store::{KeyedStore, StoreError, WriteBatch};
use crate::task_context::{TaskContext, TaskError};

pub const ADJUST_BASE_SAMPLE_RATE_OF_ORG: &str = "adjust_base_sample_rate_of_org";

const LAST_EXECUTED_KEY: &str = "ds::sliding_window_org_last_executed";

pub fn generate_sliding_window_org_cache_key(org_id: OrgId) -> String {
    format!("ds::o:{org_id}:sliding_window_org")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Sliding-window sampling is switched off; nothing was read or written.
    Disabled,
    Completed { orgs_seen: u64, rates_written: u64 },
}

/// Recomputes every active organization's sample rate from its recent volume.
///
/// Each rate is written on its own as soon as it is computed, so a run that times
/// out keeps the rates it already stored. An organization without a computable rate
/// keeps its previous one until that expires.
pub struct SlidingWindowOrgTask {
    settings: SlidingWindowSettings,
    volumes: Arc<dyn VolumeSource>,
    store: Arc<dyn KeyedStore>,
    tiers: Arc<dyn SamplingTierSource>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowOrgTask {
    pub fn new(
        settings: SlidingWindowSettings,
        volumes: Arc<dyn VolumeSource>,
        store: Arc<dyn KeyedStore>,
        tiers: Arc<dyn SamplingTierSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            volumes,
            store,
            tiers,
            clock,
        }
    }

    pub fn settings(&self) -> &SlidingWindowSettings {
        &self.settings
    }

    /// Runs the task once.
    ///
    /// On success the execution marker is refreshed. On timeout a telemetry event is
    /// emitted and the error returned so the scheduler can retry the run.
    pub async fn sliding_window_org(&self) -> Result<TaskOutcome, TaskError> {
        let Some(window_size) = self.settings.window_size() else {
            info!(target: "dynamic_sampling::sliding_window", "Sliding window sampling is disabled; skipping run");
            return Ok(TaskOutcome::Disabled);
        };

        let mut context = TaskContext::new(self.settings.task_name(), self.settings.max_task_duration());
        match self.adjust_all_orgs(window_size, &mut context).await {
            Ok(outcome) => {
                mark_sliding_window_org_executed(self.store.as_ref(), self.clock.as_ref()).await?;
                TaskCompleted { context: &context }.emit();
                Ok(outcome)
            }
            Err(error) => {
                if error.is_timeout() {
                    TaskTimedOut { context: &context }.emit();
                }
                Err(error)
            }
        }
    }

    async fn adjust_all_orgs(&self, window_size: u32, context: &mut TaskContext) -> Result<TaskOutcome, TaskError> {
        let query = VolumeQuery {
            time_interval: Duration::from_secs(u64::from(window_size) * 60 * 60),
            max_orgs: self.settings.max_orgs_per_query(),
        };
        let mut pages = ActiveOrgVolumes::new(self.volumes.as_ref(), query);

        let mut orgs_seen = 0;
        let mut rates_written = 0;
        while let Some(page) = pages.next_page(context).await? {
            for OrgVolume { org_id, total } in page {
                orgs_seen += 1;
                if self.adjust_base_sample_rate_of_org(org_id, total, window_size, context).await? {
                    rates_written += 1;
                }
            }
        }

        Ok(TaskOutcome::Completed {
            orgs_seen,
            rates_written,
        })
    }

    /// Computes and stores the sample rate of one organization.
    ///
    /// The deadline is checked before anything else, so an organization is either
    /// fully processed or not touched. Returns whether a rate was written.
    pub async fn adjust_base_sample_rate_of_org(
        &self,
        org_id: OrgId,
        total_root_count: u64,
        window_size: u32,
        context: &mut TaskContext,
    ) -> Result<bool, TaskError> {
        context.check_deadline()?;
        let started = Instant::now();

        let written = match compute_guarded_sliding_window_sample_rate(
            self.tiers.as_ref(),
            org_id,
            total_root_count,
            window_size,
        ) {
            None => {
                SampleRateSkipped {
                    org_id,
                    total_root_count,
                }
                .emit();
                false
            }
            Some(sample_rate) => {
                let mut batch = WriteBatch::new();
                batch.stage(
                    generate_sliding_window_org_cache_key(org_id),
                    sample_rate.to_string(),
                    Some(self.settings.rate_ttl()),
                );
                batch.commit(self.store.as_ref()).await?;
                SampleRateWritten { org_id, sample_rate }.emit();
                true
            }
        };

        context.update_function_state(ADJUST_BASE_SAMPLE_RATE_OF_ORG, |state| {
            state.num_iterations += 1;
            state.num_orgs += 1;
            if written {
                state.num_db_calls += 1;
            }
            state.execution_time += started.elapsed();
        });
        Ok(written)
    }
}

/// Stored sample rate of an organization, or `default_sample_rate` when none is stored.
///
/// The flag is true when the stored rate was used.
pub async fn get_org_sample_rate<S>(store: &S, org_id: OrgId, default_sample_rate: f64) -> Result<(f64, bool), StoreError>
where
    S: KeyedStore + ?Sized,
{
    let key = generate_sliding_window_org_cache_key(org_id);
    let Some(raw) = store.get(&key).await? else {
        return Ok((default_sample_rate, false));
    };

    match raw.parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok((rate, true)),
        _ => {
            warn!(target: "dynamic_sampling::sliding_window", %key, value = %raw, "Ignoring malformed stored sample rate");
            Ok((default_sample_rate, false))
        }
    }
}

/// Records the time of the last successful run; read by consumers as a freshness signal.
pub async fn mark_sliding_window_org_executed<S>(store: &S, clock: &dyn Clock) -> Result<(), StoreError>
where
    S: KeyedStore + ?Sized,
{
    store
        .set(LAST_EXECUTED_KEY, clock.now().timestamp().to_string(), None)
        .await
}

pub async fn was_sliding_window_org_executed<S>(store: &S) -> Result<bool, StoreError>
where
    S: KeyedStore + ?Sized,
{
    store.exists(LAST_EXECUTED_KEY).await
}

pub async fn last_sliding_window_org_execution<S>(store: &S) -> Result<Option<DateTime<Utc>>, StoreError>
where
    S: KeyedStore + ?Sized,
{
    let raw = store.get(LAST_EXECUTED_KEY).await?;
    Ok(raw
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::time;

    use super::*;
    use crate::clock::FixedClock;
    use crate::sliding_window::{SamplingTier, StaticVolumeSource, TierTable};
    use crate::store::InMemoryStore;

    fn tiers() -> TierTable {
        TierTable::new(vec![
            SamplingTier {
                volume: 1_000_000,
                sample_rate: 0.5,
            },
            SamplingTier {
                volume: 100_000_000,
                sample_rate: 0.1,
            },
        ])
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()
    }

    fn volumes(entries: &[(OrgId, u64)]) -> Arc<StaticVolumeSource> {
        Arc::new(StaticVolumeSource::new(
            entries.iter().map(|&(org_id, total)| OrgVolume { org_id, total }).collect(),
        ))
    }

    fn task(
        settings: SlidingWindowSettings,
        volumes: Arc<dyn VolumeSource>,
        store: Arc<InMemoryStore>,
        tiers: Arc<dyn SamplingTierSource>,
    ) -> SlidingWindowOrgTask {
        SlidingWindowOrgTask::new(settings, volumes, store, tiers, Arc::new(FixedClock(now())))
    }

    /// Counts lookups so tests can assert no work was started.
    #[derive(Default)]
    struct CountingTiers {
        lookups: AtomicUsize,
    }

    impl SamplingTierSource for CountingTiers {
        fn tier_for_volume(&self, org_id: OrgId, monthly_volume: u64) -> Result<Option<SamplingTier>, crate::Error> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            tiers().tier_for_volume(org_id, monthly_volume)
        }
    }

    /// Burns `delay` of (paused) time on every page fetch.
    struct SlowVolumes {
        inner: StaticVolumeSource,
        delay: Duration,
    }

    #[async_trait]
    impl VolumeSource for SlowVolumes {
        async fn fetch_page(&self, query: &VolumeQuery, offset: usize) -> Result<Vec<OrgVolume>, crate::Error> {
            time::advance(self.delay).await;
            self.inner.fetch_page(query, offset).await
        }
    }

    #[tokio::test]
    async fn rates_are_written_with_ttl() {
        let store = Arc::new(InMemoryStore::new());
        let task = task(
            SlidingWindowSettings::default(),
            volumes(&[(1, 100), (2, 1_000_000)]),
            Arc::clone(&store),
            Arc::new(tiers()),
        );

        let outcome = task.sliding_window_org().await.unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                orgs_seen: 2,
                rates_written: 2
            }
        );
        for (org_id, rate) in [(1, "0.5"), (2, "0.1")] {
            let writes = store.writes_for(&generate_sliding_window_org_cache_key(org_id)).await;
            assert_eq!(writes.len(), 1, "org {org_id}");
            assert_eq!(writes[0].value, rate);
            assert_eq!(writes[0].ttl, Some(Duration::from_secs(24 * 60 * 60)));
        }
        assert_eq!(store.pipeline_count().await, 2);
        assert_eq!(get_org_sample_rate(store.as_ref(), 2, 1.0).await.unwrap(), (0.1, true));
        assert!(was_sliding_window_org_executed(store.as_ref()).await.unwrap());
        assert_eq!(last_sliding_window_org_execution(store.as_ref()).await.unwrap(), Some(now()));
    }

    #[tokio::test]
    async fn missing_rate_leaves_stored_rate_alone() {
        let store = Arc::new(InMemoryStore::new());
        let key = generate_sliding_window_org_cache_key(9);
        store.set(&key, "0.3".to_string(), None).await.unwrap();
        let task = task(
            SlidingWindowSettings::default(),
            volumes(&[(9, 0)]),
            Arc::clone(&store),
            Arc::new(TierTable::default()),
        );

        let outcome = task.sliding_window_org().await.unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                orgs_seen: 1,
                rates_written: 0
            }
        );
        assert_eq!(store.writes_for(&key).await.len(), 1);
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("0.3"));
    }

    #[tokio::test]
    async fn expired_deadline_fails_before_any_io() {
        time::pause();

        let store = Arc::new(InMemoryStore::new());
        let counting = Arc::new(CountingTiers::default());
        let task = task(
            SlidingWindowSettings::default(),
            volumes(&[]),
            Arc::clone(&store),
            Arc::clone(&counting) as Arc<dyn SamplingTierSource>,
        );
        let start = Instant::now();
        let mut context = TaskContext::with_expiration("sliding_window_org", start, start);
        time::advance(Duration::from_millis(1)).await;

        let err = task
            .adjust_base_sample_rate_of_org(1, 100, 24, &mut context)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(counting.lookups.load(Ordering::Relaxed), 0);
        assert!(store.writes().await.is_empty());
        assert_eq!(store.read_count().await, 0);
        assert_eq!(context.get_function_state(ADJUST_BASE_SAMPLE_RATE_OF_ORG).num_iterations, 0);
    }

    #[tokio::test]
    async fn timeout_keeps_rates_already_written() {
        time::pause();

        let store = Arc::new(InMemoryStore::new());
        let slow = SlowVolumes {
            inner: StaticVolumeSource::new((1..=4).map(|org_id| OrgVolume { org_id, total: 100 }).collect()),
            delay: Duration::from_secs(2),
        };
        let settings = SlidingWindowSettings::builder()
            .max_orgs_per_query(2)
            .max_task_duration(Duration::from_secs(3))
            .build();
        let task = task(settings, Arc::new(slow), Arc::clone(&store), Arc::new(tiers()));

        let err = task.sliding_window_org().await.unwrap_err();

        assert!(err.is_timeout());
        for org_id in 1..=2 {
            assert_eq!(get_org_sample_rate(store.as_ref(), org_id, 1.0).await.unwrap(), (0.5, true));
        }
        for org_id in 3..=4 {
            assert_eq!(get_org_sample_rate(store.as_ref(), org_id, 1.0).await.unwrap(), (1.0, false));
        }
        assert!(!was_sliding_window_org_executed(store.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn disabled_task_does_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let source = volumes(&[(1, 100)]);
        let task = task(
            SlidingWindowSettings::builder().enabled(false).build(),
            Arc::clone(&source) as Arc<dyn VolumeSource>,
            Arc::clone(&store),
            Arc::new(tiers()),
        );

        assert_eq!(task.sliding_window_org().await.unwrap(), TaskOutcome::Disabled);
        assert_eq!(source.fetch_count(), 0);
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn store_errors_fail_the_run() {
        let store = Arc::new(InMemoryStore::new());
        store.set_unavailable(true).await;
        let task = task(
            SlidingWindowSettings::default(),
            volumes(&[(1, 100)]),
            Arc::clone(&store),
            Arc::new(tiers()),
        );

        let err = task.sliding_window_org().await.unwrap_err();

        assert!(matches!(err, TaskError::Store { .. }));
    }

    #[tokio::test]
    async fn malformed_stored_rate_falls_back_to_default() {
        let store = InMemoryStore::new();
        store
            .set(&generate_sliding_window_org_cache_key(5), "lots".to_string(), None)
            .await
            .unwrap();

        assert_eq!(get_org_sample_rate(&store, 5, 0.8).await.unwrap(), (0.8, false));
        assert_eq!(get_org_sample_rate(&store, 6, 0.8).await.unwrap(), (0.8, false));
    }
}
