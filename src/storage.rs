//! Metadata and blob storage
//!
//! Two collaborators sit behind traits: a [`MetadataStore`] for artifact and
//! site-job records (server-assigned ids and timestamps), and a [`BlobStore`]
//! for the image bytes themselves. Blob stores carry a lifecycle rule that
//! drops objects older than a fixed retention period, a backstop for
//! anything the sweeper never got to.

use crate::utils::sanitize_filename;
use crate::{
    ArtifactFilter, ArtifactStatus, CaptureArtifact, CaptureRequest, CrawlStatus, NewArtifact,
    NewSiteJob, OutputFormat, SiteCrawlJob, StorageBackend, StorageError, StorageSettings,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_artifact(&self, artifact: NewArtifact) -> Result<CaptureArtifact, StorageError>;

    async fn get_artifact(&self, id: Uuid) -> Result<Option<CaptureArtifact>, StorageError>;

    async fn set_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<(), StorageError>;

    async fn set_artifact_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Returns whether a record was removed.
    async fn delete_artifact(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Matching artifacts, oldest first.
    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<CaptureArtifact>, StorageError>;

    async fn create_job(&self, job: NewSiteJob) -> Result<SiteCrawlJob, StorageError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<SiteCrawlJob>, StorageError>;

    /// Count one processed URL against the job in a single atomic step.
    async fn record_job_progress(&self, id: Uuid, success: bool) -> Result<SiteCrawlJob, StorageError>;

    /// Move a job forward; illegal transitions fail with [`StorageError::Conflict`].
    async fn transition_job(&self, id: Uuid, status: CrawlStatus) -> Result<SiteCrawlJob, StorageError>;

    /// Delete a job together with its artifacts, returning the artifacts removed.
    async fn delete_job(&self, id: Uuid) -> Result<Vec<CaptureArtifact>, StorageError>;

    async fn list_expired_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SiteCrawlJob>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    async fn close(&self);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Apply the lifecycle rule, returning how many objects were dropped.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    /// Release the backend. Every later call fails.
    async fn close(&self);
}

/// `ttl` from now, saturating far in the future instead of overflowing.
pub fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or_else(|| now + chrono::Duration::days(365 * 100))
}

pub fn blob_key(id: Uuid, created: DateTime<Utc>, format: OutputFormat) -> String {
    format!(
        "captures/{}/{}.{}",
        created.format("%Y-%m-%d"),
        id,
        format.extension()
    )
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Store the image bytes, then the metadata record pointing at them.
///
/// If the record cannot be written the blob is removed again so no orphan is left behind.
pub async fn persist_capture(
    metadata: &dyn MetadataStore,
    blobs: &dyn BlobStore,
    request: &CaptureRequest,
    bytes: Vec<u8>,
    format: OutputFormat,
    ttl: Duration,
) -> Result<CaptureArtifact, StorageError> {
    let key = blob_key(Uuid::new_v4(), Utc::now(), format);
    let size_bytes = bytes.len() as u64;
    let digest = checksum(&bytes);

    blobs.put(&key, bytes, format.content_type()).await?;

    let record = NewArtifact {
        url: request.url.clone(),
        blob_key: key.clone(),
        content_type: format.content_type().to_string(),
        size_bytes,
        checksum: digest,
        viewport: request.viewport,
        full_page: request.full_page,
        site_job_id: request.site_job_id,
        expires_at: expiry_from_now(ttl),
    };

    match metadata.create_artifact(record).await {
        Ok(artifact) => {
            debug!(artifact_id = %artifact.id, key = %key, "Artifact stored");
            Ok(artifact)
        }
        Err(e) => {
            if let Err(cleanup) = blobs.delete(&key).await {
                warn!(key = %key, "Failed to remove orphaned blob: {}", cleanup);
            }
            Err(e)
        }
    }
}

/// Build the configured store pair.
pub fn build_stores(
    settings: &StorageSettings,
    blob_lifecycle: Duration,
) -> Result<(Arc<dyn MetadataStore>, Arc<dyn BlobStore>), StorageError> {
    let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let blobs: Arc<dyn BlobStore> = match &settings.backend {
        StorageBackend::Memory => Arc::new(InMemoryBlobStore::new(blob_lifecycle)),
        StorageBackend::Filesystem { root } => {
            std::fs::create_dir_all(root)?;
            Arc::new(FsBlobStore::new(root.clone(), blob_lifecycle))
        }
    };
    Ok((metadata, blobs))
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    artifacts: DashMap<Uuid, CaptureArtifact>,
    jobs: DashMap<Uuid, SiteCrawlJob>,
    closed: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        ensure_open(&self.closed, "metadata store")
    }
}

fn ensure_open(closed: &AtomicBool, what: &str) -> Result<(), StorageError> {
    if closed.load(Ordering::SeqCst) {
        Err(StorageError::Backend(format!("{what} is closed")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_artifact(&self, artifact: NewArtifact) -> Result<CaptureArtifact, StorageError> {
        self.ensure_open()?;
        let record = CaptureArtifact {
            id: Uuid::new_v4(),
            url: artifact.url,
            blob_key: artifact.blob_key,
            content_type: artifact.content_type,
            size_bytes: artifact.size_bytes,
            checksum: artifact.checksum,
            viewport: artifact.viewport,
            full_page: artifact.full_page,
            site_job_id: artifact.site_job_id,
            status: ArtifactStatus::Completed,
            created_at: Utc::now(),
            expires_at: artifact.expires_at,
        };
        self.artifacts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<CaptureArtifact>, StorageError> {
        self.ensure_open()?;
        Ok(self.artifacts.get(&id).map(|a| a.clone()))
    }

    async fn set_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut artifact = self
            .artifacts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("artifact {id}")))?;
        artifact.status = status;
        Ok(())
    }

    async fn set_artifact_expiry(&self, id: Uuid, expires_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut artifact = self
            .artifacts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("artifact {id}")))?;
        artifact.expires_at = expires_at;
        Ok(())
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<bool, StorageError> {
        self.ensure_open()?;
        Ok(self.artifacts.remove(&id).is_some())
    }

    async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<CaptureArtifact>, StorageError> {
        self.ensure_open()?;
        let mut matched: Vec<CaptureArtifact> = self
            .artifacts
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn create_job(&self, job: NewSiteJob) -> Result<SiteCrawlJob, StorageError> {
        self.ensure_open()?;
        let record = SiteCrawlJob {
            id: Uuid::new_v4(),
            root_url: job.root_url,
            sitemap_url: job.sitemap_url,
            total_pages: job.total_pages,
            captured_count: 0,
            failed_count: 0,
            status: job.status,
            viewport: job.viewport,
            full_page: job.full_page,
            sitemap_errors: job.sitemap_errors,
            created_at: Utc::now(),
            completed_at: None,
            expires_at: job.expires_at,
        };
        self.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<SiteCrawlJob>, StorageError> {
        self.ensure_open()?;
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn record_job_progress(&self, id: Uuid, success: bool) -> Result<SiteCrawlJob, StorageError> {
        self.ensure_open()?;
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("site job {id}")))?;

        if job.processed() >= job.total_pages {
            return Err(StorageError::Conflict(format!(
                "site job {id} already processed all {} pages",
                job.total_pages
            )));
        }
        if success {
            job.captured_count += 1;
        } else {
            job.failed_count += 1;
        }
        Ok(job.clone())
    }

    async fn transition_job(&self, id: Uuid, status: CrawlStatus) -> Result<SiteCrawlJob, StorageError> {
        self.ensure_open()?;
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("site job {id}")))?;

        if !job.status.can_transition_to(status) {
            return Err(StorageError::Conflict(format!(
                "site job {id} cannot move from {:?} to {:?}",
                job.status, status
            )));
        }
        job.status = status;
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn delete_job(&self, id: Uuid) -> Result<Vec<CaptureArtifact>, StorageError> {
        self.ensure_open()?;
        if self.jobs.remove(&id).is_none() {
            return Err(StorageError::NotFound(format!("site job {id}")));
        }

        let owned: Vec<Uuid> = self
            .artifacts
            .iter()
            .filter(|entry| entry.site_job_id == Some(id))
            .map(|entry| *entry.key())
            .collect();

        Ok(owned
            .into_iter()
            .filter_map(|artifact_id| self.artifacts.remove(&artifact_id).map(|(_, a)| a))
            .collect())
    }

    async fn list_expired_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SiteCrawlJob>, StorageError> {
        self.ensure_open()?;
        let mut expired: Vec<SiteCrawlJob> = self
            .jobs
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.value().clone())
            .collect();
        expired.sort_by_key(|job| job.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct StoredBlob {
    bytes: Vec<u8>,
    stored_at: DateTime<Utc>,
}

pub struct InMemoryBlobStore {
    blobs: DashMap<String, StoredBlob>,
    lifecycle: Duration,
    closed: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new(lifecycle: Duration) -> Self {
        Self {
            blobs: DashMap::new(),
            lifecycle,
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        ensure_open(&self.closed, "blob store")?;
        self.blobs.insert(
            key.to_string(),
            StoredBlob {
                bytes,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        ensure_open(&self.closed, "blob store")?;
        self.blobs
            .get(key)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        ensure_open(&self.closed, "blob store")?;
        self.blobs.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        ensure_open(&self.closed, "blob store")?;
        let Ok(lifecycle) = chrono::Duration::from_std(self.lifecycle) else {
            return Ok(0);
        };
        let before = self.blobs.len();
        self.blobs.retain(|_, blob| blob.stored_at + lifecycle > now);
        Ok(before - self.blobs.len())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        ensure_open(&self.closed, "blob store")
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Blob store rooted at a local directory; keys map onto relative paths.
pub struct FsBlobStore {
    root: PathBuf,
    lifecycle: Duration,
    closed: AtomicBool,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, lifecycle: Duration) -> Self {
        Self {
            root,
            lifecycle,
            closed: AtomicBool::new(false),
        }
    }

    /// Map a key onto a path below `root`, refusing anything that could escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        ensure_open(&self.closed, "blob store")?;
        let mut path = self.root.clone();
        for part in key.split('/') {
            let clean = sanitize_filename(part);
            if clean.is_empty() || clean == "." || clean == ".." {
                return Err(StorageError::Backend(format!("invalid blob key: {key}")));
            }
            path.push(clean);
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial image
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff: std::time::SystemTime = match chrono::Duration::from_std(self.lifecycle) {
            Ok(lifecycle) => (now - lifecycle).into(),
            Err(_) => return Ok(0),
        };
        ensure_open(&self.closed, "blob store")?;

        let mut purged = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.modified()? < cutoff {
                    remove_quietly(&entry.path()).await;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        ensure_open(&self.closed, "blob store")?;
        let meta = tokio::fs::metadata(&self.root).await?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Backend(format!(
                "{} is not a directory",
                self.root.display()
            )))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Failed to purge {}: {}", path.display(), e);
    }
}
