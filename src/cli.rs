use crate::utils::{filename_for_url, format_bytes, format_duration};
use crate::{
    ArtifactFilter, CaptureRequest, CaptureService, Config, OutputFormat, SiteCrawlRequest,
    StorageBackend, SystemHealthChecker, ViewportPreset,
};
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "site-capture")]
#[command(about = "Rendered-page screenshots for single URLs and whole sites")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrently open render sessions")]
    pub max_sessions: Option<usize>,

    #[arg(long, global = true, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Store captures below this directory instead of in memory")]
    pub storage_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Output format (png, jpeg, webp)")]
    pub format: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single URL
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, default_value = "desktop", help = "Viewport preset (desktop, mobile)")]
        viewport: String,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,

        #[arg(long, default_value = "0", help = "Extra wait in milliseconds before the snapshot")]
        wait: u64,
    },

    /// Capture every page listed in a site's sitemap
    Crawl {
        #[arg(short, long, help = "Site root URL")]
        url: String,

        #[arg(long, help = "Explicit sitemap URL")]
        sitemap: Option<String>,

        #[arg(long, help = "Maximum number of pages to capture")]
        max_pages: Option<usize>,

        #[arg(long, default_value = "desktop", help = "Viewport preset (desktop, mobile)")]
        viewport: String,

        #[arg(long, help = "Capture full scrollable pages")]
        full_page: bool,

        #[arg(long, default_value = "0", help = "Extra wait in milliseconds before each snapshot")]
        wait: u64,

        #[arg(short, long, help = "Download the captures into this directory")]
        output: Option<PathBuf>,

        #[arg(long, default_value = "2", help = "Progress polling interval in seconds")]
        progress_interval: u64,
    },

    /// Run one expiry sweep
    Sweep,

    /// Show system health
    Health,

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        file: PathBuf,
    },
}

/// Load the config file (if any) and apply command-line overrides.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config(path).await?,
        None => Config::default(),
    };

    if let Some(max_sessions) = args.max_sessions {
        config.pool.max_sessions = max_sessions;
    }
    if let Some(timeout) = args.timeout {
        config.capture.navigation_timeout = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }
    if let Some(format) = &args.format {
        config.capture.output_format = parse_format(format)?;
    }
    if let Some(root) = &args.storage_dir {
        config.storage.backend = StorageBackend::Filesystem { root: root.clone() };
    }

    config.validate().map_err(|e| anyhow!(e))?;

    info!("Configuration loaded");
    info!("Max render sessions: {}", config.pool.max_sessions);
    info!("Navigation timeout: {:?}", config.capture.navigation_timeout);
    info!("Crawl workers: {}", config.effective_crawl_workers());

    Ok(config)
}

async fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Check a config file without starting anything.
pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = read_config(path).await?;
    config.validate().map_err(|e| anyhow!(e))?;

    println!("Configuration is valid:");
    println!("  Max render sessions: {}", config.pool.max_sessions);
    println!("  Crawl workers: {}", config.effective_crawl_workers());
    println!("  Navigation timeout: {:?}", config.capture.navigation_timeout);
    println!("  Output format: {:?}", config.capture.output_format);
    println!("  Artifact retention: {}", format_duration(config.retention.artifact_ttl));
    println!("  Sweep interval: {}", format_duration(config.sweeper.interval));
    println!("  Default rate limit: {}", config.rate_limit.default_spec);

    Ok(())
}

pub struct CliRunner {
    pub service: Arc<CaptureService>,
}

impl CliRunner {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let service = CaptureService::new(config).await?;
        Ok(Self { service })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Capture {
                url,
                output,
                viewport,
                full_page,
                wait,
            } => {
                self.run_capture(url, output, parse_viewport(&viewport)?, full_page, wait)
                    .await
            }
            Commands::Crawl {
                url,
                sitemap,
                max_pages,
                viewport,
                full_page,
                wait,
                output,
                progress_interval,
            } => {
                let request = SiteCrawlRequest {
                    url,
                    sitemap_url: sitemap,
                    max_pages,
                    viewport: parse_viewport(&viewport)?,
                    full_page,
                    extra_wait_ms: wait,
                };
                self.run_crawl(request, output, Duration::from_secs(progress_interval.max(1)))
                    .await
            }
            Commands::Sweep => self.run_sweep().await,
            Commands::Health => self.show_health().await,
            Commands::Validate { file } => validate_config(&file).await,
        }
    }

    pub async fn run_capture(
        &self,
        url: String,
        output: PathBuf,
        viewport: ViewportPreset,
        full_page: bool,
        wait: u64,
    ) -> anyhow::Result<()> {
        info!("Capturing: {}", url);
        let started = Instant::now();

        let mut request = CaptureRequest::new(url);
        request.viewport = viewport;
        request.full_page = full_page;
        request.extra_wait_ms = wait;

        let artifact = self.service.submit_capture(request).await?;
        let bytes = self.service.artifact_bytes(artifact.id).await?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &bytes).await?;
        info!("Capture saved to: {}", output.display());

        println!("Capture stored:");
        println!("  URL: {}", artifact.url);
        println!("  Artifact: {}", artifact.id);
        println!("  Output: {}", output.display());
        println!("  Type: {}", artifact.content_type);
        println!("  Size: {}", format_bytes(artifact.size_bytes));
        println!("  SHA-256: {}", artifact.checksum);
        println!("  Duration: {}", format_duration(started.elapsed()));

        Ok(())
    }

    pub async fn run_crawl(
        &self,
        request: SiteCrawlRequest,
        output: Option<PathBuf>,
        poll_every: Duration,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let ack = self.service.submit_site_crawl(request).await?;

        println!("Site crawl accepted:");
        println!("  Job: {}", ack.job_id);
        println!("  Sitemap: {}", ack.sitemap_url);
        println!("  Pages: {}", ack.total_pages);
        for soft in &ack.sitemap_errors {
            println!("  Sitemap warning: {soft}");
        }

        let mut ticker = tokio::time::interval(poll_every);
        let job = loop {
            ticker.tick().await;
            let job = self.service.get_site_crawl(ack.job_id).await?;
            println!(
                "Progress: {}/{} ({:.1}%) - Captured: {}, Failed: {}",
                job.processed(),
                job.total_pages,
                (job.processed() as f64 / job.total_pages.max(1) as f64) * 100.0,
                job.captured_count,
                job.failed_count
            );
            if job.status.is_terminal() {
                break job;
            }
        };

        println!(
            "Site crawl {:?} in {}",
            job.status,
            format_duration(started.elapsed())
        );

        if let Some(dir) = output {
            self.download_job(ack.job_id, &dir).await?;
        }

        if job.captured_count == 0 {
            bail!("no page of {} could be captured", job.root_url);
        }
        Ok(())
    }

    async fn download_job(&self, job_id: uuid::Uuid, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).await?;
        let filter = ArtifactFilter {
            site_job_id: Some(job_id),
            ..Default::default()
        };
        let extension = self.service.config().capture.output_format.extension();

        let artifacts = self.service.list_artifacts(&filter).await?;
        for artifact in &artifacts {
            match self.service.artifact_bytes(artifact.id).await {
                Ok(bytes) => {
                    let path = dir.join(filename_for_url(&artifact.url, extension));
                    fs::write(&path, &bytes).await?;
                    info!("Saved capture: {}", path.display());
                }
                Err(e) => warn!(artifact_id = %artifact.id, "Could not download {}: {}", artifact.url, e),
            }
        }
        println!("Downloaded {} captures to {}", artifacts.len(), dir.display());
        Ok(())
    }

    pub async fn run_sweep(&self) -> anyhow::Result<()> {
        match self.service.run_sweep().await {
            Some(report) => {
                println!("Sweep finished:");
                println!("  Artifacts deleted: {}", report.deleted);
                println!("  Artifacts expired in place: {}", report.expired_in_place);
                println!("  Site jobs deleted: {}", report.jobs_deleted);
                println!("  Blobs purged: {}", report.blobs_purged);
                println!("  Idle rate windows pruned: {}", report.limiter_keys_pruned);
            }
            None => println!("A sweep is already running"),
        }
        Ok(())
    }

    pub async fn show_health(&self) -> anyhow::Result<()> {
        let mut checker = SystemHealthChecker::new(self.service.clone());
        let status = checker.check_system_health().await;
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }
}

fn parse_viewport(value: &str) -> anyhow::Result<ViewportPreset> {
    ViewportPreset::parse(value).ok_or_else(|| anyhow!("unknown viewport '{value}' (expected desktop or mobile)"))
}

pub fn parse_format(value: &str) -> anyhow::Result<OutputFormat> {
    OutputFormat::parse(value).ok_or_else(|| anyhow!("unknown format '{value}' (expected png, jpeg or webp)"))
}

/// Install the fmt subscriber. `RUST_LOG` wins over `--verbose`.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))?;

    Ok(())
}
