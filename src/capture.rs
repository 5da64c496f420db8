//! Capture worker: the navigate, reveal and snapshot protocol for one URL.

use crate::storage::persist_capture;
use crate::utils::validate_url;
use crate::{
    BlobStore, CaptureArtifact, CaptureError, CaptureRequest, CaptureSettings, MetadataStore,
    OutputFormat, RenderSession, ServiceError, SessionPool, ViewportPreset,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Forces content hidden behind scroll-triggered animations into its final, visible state.
pub const REVEAL_CSS: &str = "*, *::before, *::after { \
    opacity: 1 !important; \
    visibility: visible !important; \
    transform: none !important; \
    animation: none !important; \
    transition: none !important; \
}";

const PAGE_HEIGHT_SCRIPT: &str = "Math.max(\
    document.body ? document.body.scrollHeight : 0, \
    document.documentElement ? document.documentElement.scrollHeight : 0)";

#[derive(Clone)]
pub struct CaptureWorker {
    pool: Arc<SessionPool>,
    settings: CaptureSettings,
}

impl CaptureWorker {
    pub fn new(pool: Arc<SessionPool>, settings: CaptureSettings) -> Self {
        Self { pool, settings }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.settings.output_format
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Capture `url` and return the encoded image bytes.
    ///
    /// The URL is validated before a session is leased. Whatever step fails,
    /// the session goes back to the pool before this returns.
    pub async fn capture(
        &self,
        url: &str,
        viewport: ViewportPreset,
        full_page: bool,
        extra_wait: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let url = validate_url(url)?;
        let started = Instant::now();

        let result = async {
            let lease = self.pool.acquire().await?;
            let raw = self
                .run_protocol(lease.session(), url.as_str(), viewport, full_page, extra_wait)
                .await;
            lease.release().await;
            encode_image(raw?, self.settings.output_format, self.settings.jpeg_quality)
        }
        .await;

        crate::metrics::record_capture(&result, started.elapsed());
        match &result {
            Ok(bytes) => info!(
                url = %url,
                bytes = bytes.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Captured page"
            ),
            Err(e) => warn!(url = %url, "Capture failed: {}", e),
        }

        result
    }

    async fn run_protocol(
        &self,
        session: &dyn RenderSession,
        url: &str,
        viewport: ViewportPreset,
        full_page: bool,
        extra_wait: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let limit = self.settings.navigation_timeout;

        session.set_viewport(&viewport.viewport()).await?;
        session.emulate_reduced_motion().await?;

        timeout(limit, session.navigate(url))
            .await
            .map_err(|_| CaptureError::Timeout(limit))??;

        session.inject_style(REVEAL_CSS).await?;

        if full_page {
            self.scroll_through(session).await?;
        }

        let extra_wait = extra_wait.min(self.settings.max_extra_wait);
        if !extra_wait.is_zero() {
            sleep(extra_wait).await;
        }

        timeout(limit, session.snapshot(full_page))
            .await
            .map_err(|_| CaptureError::Timeout(limit))?
    }

    /// Walk the page top to bottom so lazy content loads, then return to the top.
    ///
    /// The height is re-read on every step since infinite-scroll pages grow
    /// while we scroll; `max_scroll_steps` bounds those.
    async fn scroll_through(&self, session: &dyn RenderSession) -> Result<(), CaptureError> {
        let step = self.settings.scroll_step_px.max(1);
        let mut position = 0;
        let mut steps = 0;

        while steps < self.settings.max_scroll_steps {
            let height = page_height(session).await?;
            if position >= height {
                break;
            }
            position += step;
            session.scroll_to(position).await?;
            steps += 1;
            sleep(self.settings.scroll_delay).await;
        }

        debug!(steps, position, "Scroll pass finished");
        session.scroll_to(0).await?;
        sleep(self.settings.settle_delay).await;
        Ok(())
    }
}

async fn page_height(session: &dyn RenderSession) -> Result<u64, CaptureError> {
    let value = session.run_script(PAGE_HEIGHT_SCRIPT).await?;
    Ok(value.as_f64().map(|h| h.max(0.0) as u64).unwrap_or(0))
}

/// Convert the engine's PNG snapshot into the configured output format.
pub fn encode_image(
    png_data: Vec<u8>,
    format: OutputFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, CaptureError> {
    match format {
        OutputFormat::Png => Ok(png_data),
        OutputFormat::Jpeg => {
            let img = image::load_from_memory(&png_data)?;
            // JPEG has no alpha channel
            let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());
            let mut jpeg_data = Vec::new();
            rgb.write_to(
                &mut std::io::Cursor::new(&mut jpeg_data),
                image::ImageOutputFormat::Jpeg(jpeg_quality.clamp(1, 100)),
            )?;
            Ok(jpeg_data)
        }
        OutputFormat::Webp => {
            let img = image::load_from_memory(&png_data)?;
            let mut webp_data = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut webp_data),
                image::ImageFormat::WebP,
            )?;
            Ok(webp_data)
        }
    }
}

/// Capture a request and store the result as an artifact.
pub struct CapturePipeline {
    worker: CaptureWorker,
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    artifact_ttl: Duration,
}

impl CapturePipeline {
    pub fn new(
        worker: CaptureWorker,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        artifact_ttl: Duration,
    ) -> Self {
        Self {
            worker,
            metadata,
            blobs,
            artifact_ttl,
        }
    }

    /// Callers may ask for at most `max_extra_wait` before the snapshot.
    pub fn check_extra_wait(&self, extra_wait_ms: u64) -> Result<(), ServiceError> {
        let max_wait = self.worker.settings.max_extra_wait.as_millis() as u64;
        if extra_wait_ms > max_wait {
            return Err(ServiceError::Validation(format!(
                "extra_wait_ms must be at most {max_wait}"
            )));
        }
        Ok(())
    }

    /// Failed captures never leave an artifact behind.
    pub async fn run(&self, request: &CaptureRequest) -> Result<CaptureArtifact, ServiceError> {
        let bytes = self
            .worker
            .capture(
                &request.url,
                request.viewport,
                request.full_page,
                Duration::from_millis(request.extra_wait_ms),
            )
            .await?;

        let artifact = persist_capture(
            self.metadata.as_ref(),
            self.blobs.as_ref(),
            request,
            bytes,
            self.worker.output_format(),
            self.artifact_ttl,
        )
        .await?;
        Ok(artifact)
    }
}
