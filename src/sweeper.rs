//! Expiry sweeper
//!
//! Reclaims artifacts and site jobs past their retention deadline on a fixed
//! interval, starting immediately. Artifacts left `expired` by a failed blob
//! delete are retried on every run. Runs never overlap: a tick that finds the
//! previous run still going is skipped.

use crate::{
    ArtifactFilter, ArtifactStatus, BlobStore, CaptureArtifact, MetadataStore, RateLimiter,
    SweeperSettings,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Artifacts whose blob and record are both gone
    pub deleted: usize,
    /// Artifacts whose blob could not be deleted, left marked `expired`
    pub expired_in_place: usize,
    pub jobs_deleted: usize,
    pub blobs_purged: usize,
    pub limiter_keys_pruned: usize,
}

pub struct ExpirySweeper {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    limiter: Arc<RateLimiter>,
    settings: SweeperSettings,
    running: AtomicBool,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ExpirySweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        limiter: Arc<RateLimiter>,
        settings: SweeperSettings,
    ) -> Self {
        Self {
            metadata,
            blobs,
            limiter,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One sweep, or `None` if another run is still in progress.
    pub async fn run_once(&self) -> Option<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous sweep still running, skipping");
            return None;
        }
        let _guard = RunGuard(&self.running);

        let report = self.sweep().await;
        crate::metrics::record_sweep(&report);
        if report != SweepReport::default() {
            info!(
                deleted = report.deleted,
                expired_in_place = report.expired_in_place,
                jobs_deleted = report.jobs_deleted,
                blobs_purged = report.blobs_purged,
                limiter_keys_pruned = report.limiter_keys_pruned,
                "Sweep finished"
            );
        }
        Some(report)
    }

    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        // Leftovers from earlier failed blob deletes first, then newly expired artifacts
        let passes = [
            (ArtifactStatus::Expired, None),
            (ArtifactStatus::Completed, Some(now)),
        ];
        for (status, expires_before) in passes {
            let filter = ArtifactFilter {
                status: Some(status),
                expires_before,
                limit: Some(self.settings.batch_size),
                ..Default::default()
            };
            match self.metadata.list_artifacts(&filter).await {
                Ok(batch) => {
                    for artifact in batch {
                        self.reclaim(&artifact, &mut report).await;
                    }
                }
                Err(e) => error!(?status, "Failed to list artifacts to reclaim: {}", e),
            }
        }

        match self
            .metadata
            .list_expired_jobs(now, self.settings.batch_size)
            .await
        {
            Ok(jobs) => {
                for job in jobs {
                    match self.metadata.delete_job(job.id).await {
                        Ok(artifacts) => {
                            for artifact in artifacts {
                                // The blob lifecycle rule catches whatever fails here
                                if let Err(e) = self.blobs.delete(&artifact.blob_key).await {
                                    debug!(key = %artifact.blob_key, "Cascade blob delete failed: {}", e);
                                }
                            }
                            report.jobs_deleted += 1;
                        }
                        Err(e) => error!(job_id = %job.id, "Failed to delete expired site job: {}", e),
                    }
                }
            }
            Err(e) => error!("Failed to list expired site jobs: {}", e),
        }

        match self.blobs.purge_expired(now).await {
            Ok(purged) => report.blobs_purged = purged,
            Err(e) => warn!("Blob lifecycle purge failed: {}", e),
        }

        report.limiter_keys_pruned = self.limiter.prune();
        report
    }

    /// Delete the blob, then the record. A failed blob delete leaves the
    /// record marked `expired` for the next run to retry.
    async fn reclaim(&self, artifact: &CaptureArtifact, report: &mut SweepReport) {
        if let Err(e) = self.blobs.delete(&artifact.blob_key).await {
            if artifact.status == ArtifactStatus::Expired {
                warn!(artifact_id = %artifact.id, "Blob delete failed again: {}", e);
                return;
            }
            warn!(artifact_id = %artifact.id, "Blob delete failed, marking expired: {}", e);
            match self
                .metadata
                .set_artifact_status(artifact.id, ArtifactStatus::Expired)
                .await
            {
                Ok(()) => report.expired_in_place += 1,
                Err(e) => error!(artifact_id = %artifact.id, "Failed to mark artifact expired: {}", e),
            }
            return;
        }
        match self.metadata.delete_artifact(artifact.id).await {
            Ok(_) => report.deleted += 1,
            Err(e) => error!(artifact_id = %artifact.id, "Failed to delete artifact record: {}", e),
        }
    }

    /// Run now and then every `interval` until `shutdown` flips to true.
    ///
    /// Each run gets its own task; a tick that lands while the previous run
    /// is still going is skipped rather than queued. The returned handle
    /// resolves once the loop has stopped and any in-flight run finished.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if in_flight.as_ref().map_or(false, |run| !run.is_finished()) {
                            debug!("Sweep tick skipped, previous run still in progress");
                            continue;
                        }
                        let sweeper = self.clone();
                        in_flight = Some(tokio::spawn(async move {
                            sweeper.run_once().await;
                        }));
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Some(run) = in_flight {
                let _ = run.await;
            }
            debug!("Expiry sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{expiry_from_now, InMemoryBlobStore, InMemoryMetadataStore, MockBlobStore};
    use crate::{CrawlStatus, NewArtifact, NewSiteJob, StorageError, ViewportPreset};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio::sync::Notify;

    fn settings() -> SweeperSettings {
        SweeperSettings {
            interval: Duration::from_millis(50),
            batch_size: 10,
        }
    }

    fn artifact(key: &str, expires_at: DateTime<Utc>, site_job_id: Option<uuid::Uuid>) -> NewArtifact {
        NewArtifact {
            url: "https://a.test/".to_string(),
            blob_key: key.to_string(),
            content_type: "image/png".to_string(),
            size_bytes: 1,
            checksum: String::new(),
            viewport: ViewportPreset::Desktop,
            full_page: false,
            site_job_id,
            expires_at,
        }
    }

    fn past() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(5)
    }

    #[tokio::test]
    async fn failed_blob_delete_marks_artifact_expired() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let stuck = metadata.create_artifact(artifact("stuck", past(), None)).await.unwrap();
        let gone = metadata.create_artifact(artifact("gone", past(), None)).await.unwrap();
        let fresh = metadata
            .create_artifact(artifact("fresh", expiry_from_now(Duration::from_secs(60)), None))
            .await
            .unwrap();

        let mut blobs = MockBlobStore::new();
        blobs.expect_delete().returning(|key| {
            if key == "stuck" {
                Err(StorageError::Backend("bucket unavailable".to_string()))
            } else {
                Ok(())
            }
        });
        blobs.expect_purge_expired().returning(|_| Ok(0));

        let sweeper = ExpirySweeper::new(
            metadata.clone(),
            Arc::new(blobs),
            Arc::new(RateLimiter::new("10/minute")),
            settings(),
        );
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.expired_in_place, 1);
        let stuck = metadata.get_artifact(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, ArtifactStatus::Expired);
        assert!(metadata.get_artifact(gone.id).await.unwrap().is_none());
        assert!(metadata.get_artifact(fresh.id).await.unwrap().is_some());

        // Still failing: retried, left in place, not counted twice
        let again = sweeper.run_once().await.unwrap();
        assert_eq!(again.expired_in_place, 0);
        assert_eq!(again.deleted, 0);
        assert!(metadata.get_artifact(stuck.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_in_place_artifact_is_reclaimed_once_blob_delete_recovers() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let stuck = metadata.create_artifact(artifact("stuck", past(), None)).await.unwrap();

        let mut seq = mockall::Sequence::new();
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StorageError::Backend("bucket unavailable".to_string())));
        blobs
            .expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        blobs.expect_purge_expired().returning(|_| Ok(0));

        let sweeper = ExpirySweeper::new(
            metadata.clone(),
            Arc::new(blobs),
            Arc::new(RateLimiter::new("10/minute")),
            settings(),
        );

        let first = sweeper.run_once().await.unwrap();
        assert_eq!(first.expired_in_place, 1);
        assert_eq!(
            metadata.get_artifact(stuck.id).await.unwrap().unwrap().status,
            ArtifactStatus::Expired
        );

        let second = sweeper.run_once().await.unwrap();
        assert_eq!(second.deleted, 1);
        assert!(metadata.get_artifact(stuck.id).await.unwrap().is_none());

        // Nothing left to touch
        let third = sweeper.run_once().await.unwrap();
        assert_eq!(third, SweepReport::default());
    }

    #[tokio::test]
    async fn expired_jobs_take_their_artifacts_with_them() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new(Duration::from_secs(3600)));

        let job = metadata
            .create_job(NewSiteJob {
                root_url: "https://a.test/".to_string(),
                sitemap_url: "https://a.test/sitemap.xml".to_string(),
                total_pages: 1,
                status: CrawlStatus::Processing,
                viewport: ViewportPreset::Desktop,
                full_page: false,
                sitemap_errors: Vec::new(),
                expires_at: past(),
            })
            .await
            .unwrap();
        let owned = metadata
            .create_artifact(artifact(
                "captures/owned.png",
                expiry_from_now(Duration::from_secs(60)),
                Some(job.id),
            ))
            .await
            .unwrap();
        blobs.put("captures/owned.png", vec![1], "image/png").await.unwrap();

        let sweeper = ExpirySweeper::new(
            metadata.clone(),
            blobs.clone(),
            Arc::new(RateLimiter::new("10/minute")),
            settings(),
        );
        let report = sweeper.run_once().await.unwrap();

        assert_eq!(report.jobs_deleted, 1);
        assert!(metadata.get_job(job.id).await.unwrap().is_none());
        assert!(metadata.get_artifact(owned.id).await.unwrap().is_none());
        assert!(blobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prunes_idle_rate_windows() {
        let limiter = Arc::new(RateLimiter::new("10/minute"));
        limiter.admit("idle", "1/second");

        let sweeper = ExpirySweeper::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryBlobStore::new(Duration::from_secs(60))),
            limiter.clone(),
            settings(),
        );
        sleep(Duration::from_millis(1100)).await;

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.limiter_keys_pruned, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    /// Blob store whose deletes park until the test opens the gate.
    struct GatedBlobStore {
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl BlobStore for GatedBlobStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(())
        }

        async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
            Ok(0)
        }

        async fn ping(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.create_artifact(artifact("slow", past(), None)).await.unwrap();
        let blobs = Arc::new(GatedBlobStore {
            entered: Notify::new(),
            gate: Notify::new(),
        });

        let sweeper = Arc::new(ExpirySweeper::new(
            metadata,
            blobs.clone(),
            Arc::new(RateLimiter::new("10/minute")),
            settings(),
        ));

        let first = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.run_once().await })
        };
        blobs.entered.notified().await;

        assert!(sweeper.run_once().await.is_none());

        blobs.gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_immediately_and_stops_on_shutdown() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let expired = metadata
            .create_artifact(artifact("old", past(), None))
            .await
            .unwrap();

        let sweeper = Arc::new(ExpirySweeper::new(
            metadata.clone(),
            Arc::new(InMemoryBlobStore::new(Duration::from_secs(60))),
            Arc::new(RateLimiter::new("10/minute")),
            SweeperSettings {
                interval: Duration::from_secs(3600),
                batch_size: 10,
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);

        let mut waited = 0;
        while metadata.get_artifact(expired.id).await.unwrap().is_some() && waited < 100 {
            sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(metadata.get_artifact(expired.id).await.unwrap().is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
