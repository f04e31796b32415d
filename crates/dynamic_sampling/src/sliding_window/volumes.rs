use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::time::Instant;

use super::OrgId;
use crate::task_context::{TaskContext, TaskError, VolumeQuerySnafu};

pub const FETCH_ORGS_VOLUMES: &str = "fetch_active_orgs_volumes";

/// Root transaction count of one organization over the query window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgVolume {
    pub org_id: OrgId,
    pub total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeQuery {
    /// Trailing window the counts are aggregated over.
    pub time_interval: Duration,
    /// Page size.
    pub max_orgs: usize,
}

/// Paged access to per-organization volumes, typically a query engine.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// Returns at most `query.max_orgs` organizations starting at `offset`, in a
    /// stable order. A short or empty page means there is nothing after it.
    async fn fetch_page(&self, query: &VolumeQuery, offset: usize) -> Result<Vec<OrgVolume>, crate::Error>;
}

/// Walks a [`VolumeSource`] page by page under a task's time budget.
///
/// The deadline is checked before every fetch; fetch statistics are recorded on the
/// context under [`FETCH_ORGS_VOLUMES`].
pub struct ActiveOrgVolumes<'a, V: ?Sized> {
    source: &'a V,
    query: VolumeQuery,
    offset: usize,
    exhausted: bool,
}

impl<'a, V> ActiveOrgVolumes<'a, V>
where
    V: VolumeSource + ?Sized,
{
    pub fn new(source: &'a V, query: VolumeQuery) -> Self {
        Self {
            source,
            query: VolumeQuery {
                max_orgs: query.max_orgs.max(1),
                ..query
            },
            offset: 0,
            exhausted: false,
        }
    }

    pub async fn next_page(&mut self, context: &mut TaskContext) -> Result<Option<Vec<OrgVolume>>, TaskError> {
        if self.exhausted {
            return Ok(None);
        }
        context.check_deadline()?;

        let started = Instant::now();
        let page = self
            .source
            .fetch_page(&self.query, self.offset)
            .await
            .context(VolumeQuerySnafu)?;
        let rows = page.len() as u64;
        context.update_function_state(FETCH_ORGS_VOLUMES, |state| {
            state.num_iterations += 1;
            state.num_db_calls += 1;
            state.num_rows_total += rows;
            state.num_orgs += rows;
            state.execution_time += started.elapsed();
        });

        if page.len() < self.query.max_orgs {
            self.exhausted = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        self.offset += page.len();
        trace!(target: "dynamic_sampling::sliding_window", offset = self.offset, rows, "Fetched org volumes page");
        Ok(Some(page))
    }
}

/// A [`VolumeSource`] over a fixed list, e.g. a snapshot exported from the query
/// engine. The window of the query is not applied; the snapshot is taken as-is.
#[derive(Debug, Default)]
pub struct StaticVolumeSource {
    volumes: Vec<OrgVolume>,
    fetches: AtomicUsize,
}

impl StaticVolumeSource {
    pub fn new(volumes: Vec<OrgVolume>) -> Self {
        Self {
            volumes,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Parses a JSON array of `{"org_id": .., "total": ..}` objects.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VolumeSource for StaticVolumeSource {
    async fn fetch_page(&self, query: &VolumeQuery, offset: usize) -> Result<Vec<OrgVolume>, crate::Error> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let start = offset.min(self.volumes.len());
        let end = offset.saturating_add(query.max_orgs).min(self.volumes.len());
        Ok(self.volumes[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    fn source(orgs: u64) -> StaticVolumeSource {
        StaticVolumeSource::new((1..=orgs).map(|org_id| OrgVolume { org_id, total: org_id * 10 }).collect())
    }

    fn query(max_orgs: usize) -> VolumeQuery {
        VolumeQuery {
            time_interval: Duration::from_secs(3_600),
            max_orgs,
        }
    }

    async fn drain(source: &StaticVolumeSource, max_orgs: usize) -> Vec<usize> {
        let mut context = TaskContext::new("test", Duration::from_secs(60));
        let mut pages = ActiveOrgVolumes::new(source, query(max_orgs));
        let mut sizes = Vec::new();
        while let Some(page) = pages.next_page(&mut context).await.unwrap() {
            sizes.push(page.len());
        }
        sizes
    }

    #[tokio::test]
    async fn short_page_ends_iteration() {
        let source = source(5);
        assert_eq!(drain(&source, 2).await, vec![2, 2, 1]);
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn full_last_page_needs_one_more_fetch() {
        let source = source(4);
        assert_eq!(drain(&source, 2).await, vec![2, 2]);
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn fetches_are_recorded_on_the_context() {
        let source = source(3);
        let mut context = TaskContext::new("test", Duration::from_secs(60));
        let mut pages = ActiveOrgVolumes::new(&source, query(2));
        while pages.next_page(&mut context).await.unwrap().is_some() {}

        let state = context.get_function_state(FETCH_ORGS_VOLUMES);
        assert_eq!(state.num_db_calls, 2);
        assert_eq!(state.num_rows_total, 3);
    }

    #[tokio::test]
    async fn expired_context_stops_before_fetching() {
        time::pause();

        let source = source(3);
        let mut context = TaskContext::new("test", Duration::from_secs(1));
        time::advance(Duration::from_secs(2)).await;
        let mut pages = ActiveOrgVolumes::new(&source, query(2));

        let err = pages.next_page(&mut context).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(source.fetch_count(), 0);
    }

    #[test]
    fn snapshot_loads_from_json() {
        let source = StaticVolumeSource::from_json(r#"[{"org_id": 1, "total": 50}]"#).unwrap();
        assert_eq!(source.volumes, vec![OrgVolume { org_id: 1, total: 50 }]);
    }
}
