//! Site crawl orchestration
//!
//! A submission resolves the sitemap up front, records the job and answers
//! straight away. The capture work runs on a detached task: a fixed group of
//! workers drains one shared URL queue, and every processed URL bumps the
//! job's counters in a single store call so progress is readable at any time.

use crate::utils::validate_url;
use crate::{
    expiry_from_now, sort_by_path, CapturePipeline, CaptureRequest, CrawlSettings, CrawlStatus,
    MetadataStore, NewSiteJob, RetentionSettings, ServiceError, SiteCrawlAck, SiteCrawlRequest,
    SitemapError, SitemapResolver, ViewportPreset,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct SiteCrawler {
    pipeline: Arc<CapturePipeline>,
    resolver: SitemapResolver,
    metadata: Arc<dyn MetadataStore>,
    settings: CrawlSettings,
    retention: RetentionSettings,
    workers: usize,
}

/// Per-job capture options shared by every worker.
#[derive(Debug, Clone)]
struct CrawlOptions {
    job_id: Uuid,
    viewport: ViewportPreset,
    full_page: bool,
    extra_wait_ms: u64,
}

impl SiteCrawler {
    pub fn new(
        pipeline: Arc<CapturePipeline>,
        resolver: SitemapResolver,
        metadata: Arc<dyn MetadataStore>,
        settings: CrawlSettings,
        retention: RetentionSettings,
        workers: usize,
    ) -> Self {
        Self {
            pipeline,
            resolver,
            metadata,
            settings,
            retention,
            workers: workers.max(1),
        }
    }

    /// Resolve the site's pages, create the job and start crawling in the background.
    pub async fn submit(self: &Arc<Self>, request: SiteCrawlRequest) -> Result<SiteCrawlAck, ServiceError> {
        let root = validate_url(&request.url).map_err(|e| ServiceError::Validation(e.to_string()))?;
        let max_pages = request.max_pages.unwrap_or(self.settings.default_max_pages);
        if max_pages == 0 || max_pages > self.settings.max_pages_limit {
            return Err(ServiceError::Validation(format!(
                "max_pages must be between 1 and {}",
                self.settings.max_pages_limit
            )));
        }
        self.pipeline.check_extra_wait(request.extra_wait_ms)?;

        let sitemap_url = self
            .resolver
            .discover(root.as_str(), request.sitemap_url.as_deref())
            .await?;
        let collection = self.resolver.collect(&sitemap_url, max_pages).await;
        let sitemap_errors: Vec<String> = collection.errors.iter().map(|e| e.to_string()).collect();

        let mut entries = collection.entries;
        if entries.is_empty() {
            for soft in &sitemap_errors {
                warn!(sitemap = %sitemap_url, "{}", soft);
            }
            return Err(SitemapError::Empty { url: sitemap_url }.into());
        }
        sort_by_path(&mut entries);
        let urls: Vec<String> = entries.into_iter().map(|e| e.loc).collect();

        let job = self
            .metadata
            .create_job(NewSiteJob {
                root_url: root.to_string(),
                sitemap_url: sitemap_url.clone(),
                total_pages: urls.len(),
                status: CrawlStatus::Processing,
                viewport: request.viewport,
                full_page: request.full_page,
                sitemap_errors: sitemap_errors.clone(),
                expires_at: expiry_from_now(self.retention.job_ttl),
            })
            .await?;

        info!(
            job_id = %job.id,
            sitemap = %sitemap_url,
            pages = urls.len(),
            "Site crawl accepted"
        );

        let options = CrawlOptions {
            job_id: job.id,
            viewport: request.viewport,
            full_page: request.full_page,
            extra_wait_ms: request.extra_wait_ms,
        };
        self.spawn_crawl(urls, options);

        Ok(SiteCrawlAck {
            job_id: job.id,
            sitemap_url,
            total_pages: job.total_pages,
            sitemap_errors,
        })
    }

    /// Detach the crawl. The outer task is the error boundary: whatever
    /// happens to the inner one, the job ends up terminal.
    fn spawn_crawl(self: &Arc<Self>, urls: Vec<String>, options: CrawlOptions) {
        let crawler = self.clone();
        tokio::spawn(async move {
            let job_id = options.job_id;
            let run = tokio::spawn(crawler.clone().run_job(urls, options));

            let status = match run.await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    error!(job_id = %job_id, "Site crawl aborted: {}", e);
                    crawler.fail_job(job_id).await
                }
                Err(e) => {
                    error!(job_id = %job_id, "Site crawl task died: {}", e);
                    crawler.fail_job(job_id).await
                }
            };
            crate::metrics::record_crawl_finished(status);
        });
    }

    async fn run_job(self: Arc<Self>, urls: Vec<String>, options: CrawlOptions) -> Result<CrawlStatus, ServiceError> {
        let job_id = options.job_id;
        let started = Instant::now();
        let worker_count = self.workers.min(urls.len()).max(1);
        let queue = Arc::new(Mutex::new(VecDeque::from(urls)));

        info!(job_id = %job_id, workers = worker_count, "Starting site crawl");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(self.clone().crawl_worker(worker_id, queue.clone(), options.clone()));
        }

        let mut lost_workers = 0;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %job_id, "Crawl worker died: {}", e);
                lost_workers += 1;
            }
        }
        if lost_workers > 0 {
            return Err(ServiceError::Internal(format!(
                "{lost_workers} crawl worker(s) died"
            )));
        }

        let job = self
            .metadata
            .get_job(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("site job {job_id}")))?;

        let status = if job.captured_count > 0 {
            CrawlStatus::Completed
        } else {
            CrawlStatus::Failed
        };
        self.metadata.transition_job(job_id, status).await?;

        info!(
            job_id = %job_id,
            captured = job.captured_count,
            failed = job.failed_count,
            total = job.total_pages,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Site crawl finished: {:?}",
            status
        );
        Ok(status)
    }

    async fn crawl_worker(
        self: Arc<Self>,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<String>>>,
        options: CrawlOptions,
    ) {
        debug!(job_id = %options.job_id, worker_id, "Crawl worker started");

        loop {
            let Some(url) = queue.lock().await.pop_front() else {
                break;
            };

            let request = CaptureRequest {
                url: url.clone(),
                viewport: options.viewport,
                full_page: options.full_page,
                extra_wait_ms: options.extra_wait_ms,
                site_job_id: Some(options.job_id),
            };

            let success = match self.pipeline.run(&request).await {
                Ok(artifact) => {
                    debug!(job_id = %options.job_id, worker_id, artifact_id = %artifact.id, "Captured {}", url);
                    true
                }
                Err(e) => {
                    warn!(job_id = %options.job_id, worker_id, "Failed to capture {}: {}", url, e);
                    false
                }
            };

            if let Err(e) = self.metadata.record_job_progress(options.job_id, success).await {
                error!(job_id = %options.job_id, "Failed to record progress: {}", e);
            }
        }

        debug!(job_id = %options.job_id, worker_id, "Crawl worker drained");
    }

    async fn fail_job(&self, job_id: Uuid) -> CrawlStatus {
        if let Err(e) = self.metadata.transition_job(job_id, CrawlStatus::Failed).await {
            error!(job_id = %job_id, "Could not mark site job failed: {}", e);
        }
        CrawlStatus::Failed
    }
}
