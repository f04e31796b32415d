use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dynamic_sampling::sliding_window::{OrgVolume, StaticVolumeSource, VolumeQuery, VolumeSource};
use snafu::ResultExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{ConfigError, ReadFileSnafu, VolumesSnafu};

/// Org volumes read from a JSON snapshot that an exporter rewrites between runs.
///
/// The file is re-read whenever a run starts paging from offset 0, so each run sees
/// the latest export; later pages of the same run are served from that copy. The
/// query's `time_interval` is not applied: the exporter owns the window.
#[derive(Debug)]
pub struct SnapshotFileSource {
    path: PathBuf,
    snapshot: RwLock<Arc<StaticVolumeSource>>,
}

impl SnapshotFileSource {
    /// Loads the snapshot once up front so a missing or malformed file fails startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let snapshot = crate::load_volume_snapshot(&path)?;
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn reload(&self) -> Result<StaticVolumeSource, ConfigError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .context(ReadFileSnafu { path: &self.path })?;
        StaticVolumeSource::from_json(&raw).context(VolumesSnafu { path: &self.path })
    }
}

#[async_trait]
impl VolumeSource for SnapshotFileSource {
    async fn fetch_page(&self, query: &VolumeQuery, offset: usize) -> Result<Vec<OrgVolume>, dynamic_sampling::Error> {
        if offset == 0 {
            let fresh = self.reload().await?;
            *self.snapshot.write().await = Arc::new(fresh);
            debug!(path = %self.path.display(), "Reloaded org volume snapshot");
        }
        let snapshot = Arc::clone(&*self.snapshot.read().await);
        snapshot.fetch_page(query, offset).await
    }
}
