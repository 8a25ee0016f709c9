//! Reclaims abandoned upload scratch space.
//!
//! Every upload directory carries a `startedat` marker written at creation.
//! Uploads older than the cutoff are assumed abandoned (their client is gone
//! or finished long ago) and their whole directory is removed. Published
//! blobs are never touched; commit moves content out of `_uploads/` first.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;

use crate::errors::{Error, Result};
use crate::paths::PathBuilder;
use crate::StorageDriver;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub scanned: usize,
    pub purged: usize,
    pub skipped: usize,
}

pub struct UploadPurger {
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    age: Duration,
    dry_run: bool,
}

impl UploadPurger {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        paths: PathBuilder,
        age: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            driver,
            paths,
            age,
            dry_run,
        }
    }

    pub async fn run(&self) -> Result<PurgeSummary> {
        let mut summary = PurgeSummary::default();
        let cutoff = Utc::now() - self.age;
        let root = self.paths.repositories_root();

        let mut entries = match self.driver.walk(&root).await {
            Ok(stream) => stream,
            Err(Error::PathNotFound { .. }) => return Ok(summary),
            Err(e) => return Err(e),
        };

        let mut candidates: Vec<String> = Vec::new();
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Some(upload_dir) = upload_dir_of_started_at(&entry.path) {
                candidates.push(upload_dir.to_string());
            }
        }

        for upload_dir in candidates {
            summary.scanned += 1;
            let started_at = format!("{upload_dir}/startedat");
            match self.started_before(&started_at, cutoff).await? {
                Some(true) => {
                    if self.dry_run {
                        summary.purged += 1;
                        continue;
                    }
                    match self.driver.delete(&upload_dir).await {
                        Ok(()) | Err(Error::PathNotFound { .. }) => summary.purged += 1,
                        Err(e) => return Err(e),
                    }
                    tracing::info!(path = %upload_dir, "purged abandoned upload");
                }
                Some(false) => summary.skipped += 1,
                // marker vanished mid-scan: the upload just completed or was
                // cancelled, leave it alone
                None => summary.skipped += 1,
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            purged = summary.purged,
            skipped = summary.skipped,
            dry_run = self.dry_run,
            "upload purge complete"
        );
        Ok(summary)
    }

    /// Whether the upload's `startedat` marker predates the cutoff; `None`
    /// when the marker is missing. An unreadable timestamp counts as old —
    /// it cannot be trusted to pin the upload as live.
    async fn started_before(
        &self,
        marker_path: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let content = match self.driver.get_content(marker_path).await {
            Ok(c) => c,
            Err(Error::PathNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let started = std::str::from_utf8(&content)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(Some(match started {
            Some(t) => t < cutoff,
            None => true,
        }))
    }
}

fn upload_dir_of_started_at(path: &str) -> Option<&str> {
    let dir = path.strip_suffix("/startedat")?;
    let (_, tail) = dir.rsplit_once("/_uploads/")?;
    if tail.contains('/') {
        return None;
    }
    Some(dir)
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::blobs::{BlobService, RedirectOptions};
    use crate::inmemory::InMemoryDriver;

    fn fixture() -> (Arc<dyn StorageDriver>, PathBuilder, InMemoryDriver) {
        let raw = InMemoryDriver::new();
        (
            Arc::new(raw.clone()),
            PathBuilder::new("/registry"),
            raw,
        )
    }

    fn purger(driver: &Arc<dyn StorageDriver>, paths: &PathBuilder, age: Duration) -> UploadPurger {
        UploadPurger::new(driver.clone(), paths.clone(), age, false)
    }

    #[tokio::test]
    async fn fresh_uploads_are_kept() {
        let (driver, paths, _) = fixture();
        let blobs = BlobService::new(
            driver.clone(),
            paths.clone(),
            "app",
            RedirectOptions::default(),
        );
        let mut upload = blobs.create().await.unwrap();
        upload.write(Bytes::from_static(b"in flight")).await.unwrap();

        let summary = purger(&driver, &paths, Duration::hours(1)).run().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.purged, 0);
        assert_eq!(summary.skipped, 1);

        // still committable afterwards
        upload.commit(None).await.unwrap();
    }

    #[tokio::test]
    async fn aged_uploads_are_purged() {
        let (driver, paths, raw) = fixture();
        let id = uuid::Uuid::new_v4();
        let stale = (Utc::now() - Duration::days(2)).to_rfc3339();
        driver
            .put_content(
                &paths.upload_started_at_path("app", &id),
                Bytes::from(stale),
            )
            .await
            .unwrap();
        driver
            .put_content(
                &paths.upload_data_path("app", &id),
                Bytes::from_static(b"partial"),
            )
            .await
            .unwrap();

        let summary = purger(&driver, &paths, Duration::hours(24)).run().await.unwrap();
        assert_eq!(summary.purged, 1);
        assert_eq!(raw.object_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_marker_counts_as_old() {
        let (driver, paths, raw) = fixture();
        let id = uuid::Uuid::new_v4();
        driver
            .put_content(
                &paths.upload_started_at_path("app", &id),
                Bytes::from_static(b"not a timestamp"),
            )
            .await
            .unwrap();

        let summary = purger(&driver, &paths, Duration::hours(1)).run().await.unwrap();
        assert_eq!(summary.purged, 1);
        assert_eq!(raw.object_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let (driver, paths, raw) = fixture();
        let id = uuid::Uuid::new_v4();
        let stale = (Utc::now() - Duration::days(2)).to_rfc3339();
        driver
            .put_content(
                &paths.upload_started_at_path("app", &id),
                Bytes::from(stale),
            )
            .await
            .unwrap();

        let purger = UploadPurger::new(driver.clone(), paths.clone(), Duration::hours(1), true);
        let summary = purger.run().await.unwrap();
        assert_eq!(summary.purged, 1);
        assert_eq!(raw.object_count(), 1);
    }
}
