//! Capture service facade
//!
//! Wires the pool, capture pipeline, sitemap resolver, crawl orchestrator,
//! rate limiter and sweeper together and exposes the operations an HTTP or
//! CLI front end calls. Shutdown drains in a fixed order: stop admitting new
//! work, stop the sweeper, drain the pool, then close the stores.

use crate::utils::validate_url;
use crate::{
    build_stores, ArtifactFilter, ArtifactStatus, BlobStore, CaptureArtifact, CaptureError,
    CapturePipeline, CaptureRequest, CaptureWorker, ChromeEngine, Config, ExpirySweeper,
    MetadataStore, PoolStats, RateDecision, RateLimiter, RenderEngine, ServiceError,
    SessionPool, SiteCrawlAck, SiteCrawlJob, SiteCrawlRequest, SiteCrawler, SitemapResolver,
    SweepReport,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Entry point for everything a caller can ask of the system
///
/// # Examples
///
/// ```rust,no_run
/// use site_capture::{CaptureRequest, CaptureService, Config};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = CaptureService::new(Config::default()).await?;
///
///     let artifact = service
///         .submit_capture(CaptureRequest::new("https://example.com"))
///         .await?;
///     println!("Stored {} ({} bytes)", artifact.id, artifact.size_bytes);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct CaptureService {
    config: Config,
    pool: Arc<SessionPool>,
    pipeline: Arc<CapturePipeline>,
    crawler: Arc<SiteCrawler>,
    limiter: Arc<RateLimiter>,
    sweeper: Arc<ExpirySweeper>,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    accepting: AtomicBool,
    sweeper_stop: watch::Sender<bool>,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureService {
    /// Launch Chrome and build the configured stores.
    pub async fn new(config: Config) -> Result<Arc<Self>, ServiceError> {
        config.validate().map_err(ServiceError::Validation)?;
        let engine: Arc<dyn RenderEngine> = Arc::new(ChromeEngine::new(config.browser.clone()));
        let (metadata, blobs) = build_stores(&config.storage, config.retention.artifact_ttl)?;
        Self::with_components(config, engine, metadata, blobs).await
    }

    /// Build the service around an existing engine and store pair.
    pub async fn with_components(
        config: Config,
        engine: Arc<dyn RenderEngine>,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>, ServiceError> {
        config.validate().map_err(ServiceError::Validation)?;

        let pool = SessionPool::start(engine, config.pool.clone()).await?;
        let worker = CaptureWorker::new(pool.clone(), config.capture.clone());
        let pipeline = Arc::new(CapturePipeline::new(
            worker,
            metadata.clone(),
            blobs.clone(),
            config.retention.artifact_ttl,
        ));

        let resolver = SitemapResolver::new(&config.crawl)?;
        let crawler = Arc::new(SiteCrawler::new(
            pipeline.clone(),
            resolver,
            metadata.clone(),
            config.crawl.clone(),
            config.retention.clone(),
            config.effective_crawl_workers(),
        ));

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit.default_spec));
        let sweeper = Arc::new(ExpirySweeper::new(
            metadata.clone(),
            blobs.clone(),
            limiter.clone(),
            config.sweeper.clone(),
        ));
        let (sweeper_stop, stop_rx) = watch::channel(false);
        let sweeper_task = sweeper.clone().spawn(stop_rx);

        info!(
            max_sessions = pool.ceiling(),
            crawl_workers = config.effective_crawl_workers(),
            "Capture service started"
        );

        Ok(Arc::new(Self {
            config,
            pool,
            pipeline,
            crawler,
            limiter,
            sweeper,
            metadata,
            blobs,
            accepting: AtomicBool::new(true),
            sweeper_stop,
            sweeper_task: Mutex::new(Some(sweeper_task)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_accepting(&self) -> Result<(), ServiceError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::NotAccepting)
        }
    }

    /// Capture one URL and store it as an artifact.
    pub async fn submit_capture(&self, request: CaptureRequest) -> Result<CaptureArtifact, ServiceError> {
        self.ensure_accepting()?;
        validate_url(&request.url).map_err(|e| ServiceError::Validation(e.to_string()))?;
        self.pipeline.check_extra_wait(request.extra_wait_ms)?;

        match self.pipeline.run(&request).await {
            Ok(artifact) => {
                info!(artifact_id = %artifact.id, url = %artifact.url, "Capture stored");
                Ok(artifact)
            }
            Err(ServiceError::Capture(CaptureError::PoolShuttingDown)) => Err(ServiceError::PoolShuttingDown),
            Err(e) => {
                warn!(url = %request.url, "Capture failed: {}", e);
                Err(e)
            }
        }
    }

    /// Accept a site crawl; the captures themselves run in the background.
    pub async fn submit_site_crawl(&self, request: SiteCrawlRequest) -> Result<SiteCrawlAck, ServiceError> {
        self.ensure_accepting()?;
        self.crawler.submit(request).await
    }

    pub async fn get_site_crawl(&self, job_id: Uuid) -> Result<SiteCrawlJob, ServiceError> {
        self.metadata
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("site job {job_id}")))
    }

    pub async fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<CaptureArtifact>, ServiceError> {
        Ok(self.metadata.list_artifacts(filter).await?)
    }

    pub async fn get_artifact(&self, id: Uuid) -> Result<CaptureArtifact, ServiceError> {
        self.metadata
            .get_artifact(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("artifact {id}")))
    }

    /// Image bytes of a stored artifact.
    pub async fn artifact_bytes(&self, id: Uuid) -> Result<Vec<u8>, ServiceError> {
        let artifact = self.get_artifact(id).await?;
        Ok(self.blobs.get(&artifact.blob_key).await?)
    }

    /// `immediate` removes blob and record now; otherwise the artifact is
    /// expired on the spot and left for the next sweep.
    pub async fn delete_artifact(&self, id: Uuid, immediate: bool) -> Result<(), ServiceError> {
        let artifact = self.get_artifact(id).await?;

        if !immediate {
            self.metadata.set_artifact_expiry(id, Utc::now()).await?;
            debug!(artifact_id = %id, "Artifact scheduled for the next sweep");
            return Ok(());
        }

        if let Err(e) = self.blobs.delete(&artifact.blob_key).await {
            warn!(artifact_id = %id, "Blob delete failed, marking expired: {}", e);
            if let Err(mark) = self.metadata.set_artifact_status(id, ArtifactStatus::Expired).await {
                error!(artifact_id = %id, "Failed to mark artifact expired: {}", mark);
            }
            return Err(e.into());
        }
        self.metadata.delete_artifact(id).await?;
        info!(artifact_id = %id, "Artifact deleted");
        Ok(())
    }

    /// Sliding-window admission for `caller`; a rejection carries the retry hint.
    pub fn admit(&self, caller: &str, spec: &str) -> Result<RateDecision, ServiceError> {
        let decision = self.limiter.admit(caller, spec);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ServiceError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }

    /// One sweep outside the schedule, `None` if a run is already going.
    pub async fn run_sweep(&self) -> Option<SweepReport> {
        self.sweeper.run_once().await
    }

    pub async fn is_database_healthy(&self) -> bool {
        match self.metadata.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Metadata store unhealthy: {}", e);
                false
            }
        }
    }

    pub async fn is_storage_healthy(&self) -> bool {
        match self.blobs.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Blob store unhealthy: {}", e);
                false
            }
        }
    }

    pub fn is_render_engine_healthy(&self) -> (bool, PoolStats) {
        let stats = self.pool.stats();
        (stats.connected && !stats.shutting_down, stats)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Ordered shutdown. Calling it twice is harmless.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            debug!("Capture service already shut down");
            return;
        }
        info!("Shutting down capture service");

        let _ = self.sweeper_stop.send(true);
        if let Some(task) = self.sweeper_task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Sweeper task ended abnormally: {}", e);
            }
        }

        self.pool.shutdown().await;
        self.metadata.close().await;
        self.blobs.close().await;

        info!("Capture service shut down");
    }
}
