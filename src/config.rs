//! Configuration management with serde serialization/deserialization
//!
//! Every section has a `Default` so a JSON config file only needs to name the
//! values it overrides.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture service
///
/// # Examples
///
/// ```rust
/// use site_capture::Config;
///
/// let mut config = Config::default();
/// config.pool.max_sessions = 4;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolSettings,
    pub capture: CaptureSettings,
    pub crawl: CrawlSettings,
    pub retention: RetentionSettings,
    pub sweeper: SweeperSettings,
    pub rate_limit: RateLimitSettings,
    pub storage: StorageSettings,
    pub browser: BrowserSettings,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.max_sessions == 0 {
            return Err("pool.max_sessions must be greater than 0".into());
        }
        if self.capture.navigation_timeout.is_zero() {
            return Err("capture.navigation_timeout must be greater than 0".into());
        }
        if self.capture.scroll_step_px == 0 {
            return Err("capture.scroll_step_px must be greater than 0".into());
        }
        if self.crawl.default_max_pages == 0 || self.crawl.max_pages_limit == 0 {
            return Err("crawl page limits must be greater than 0".into());
        }
        if self.crawl.default_max_pages > self.crawl.max_pages_limit {
            return Err("crawl.default_max_pages exceeds crawl.max_pages_limit".into());
        }
        if self.sweeper.interval.is_zero() || self.sweeper.batch_size == 0 {
            return Err("sweeper interval and batch_size must be greater than 0".into());
        }
        if self.retention.artifact_ttl.is_zero() || self.retention.job_ttl.is_zero() {
            return Err("retention periods must be greater than 0".into());
        }
        Ok(())
    }

    /// Crawl worker count, always leaving at least one pool session as headroom.
    pub fn effective_crawl_workers(&self) -> usize {
        let headroom = self.pool.max_sessions.saturating_sub(1).max(1);
        self.crawl.workers.clamp(1, headroom)
    }
}

/// Render session pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Ceiling on concurrently open render sessions, fixed at startup
    pub max_sessions: usize,

    /// How long shutdown waits for leased sessions before force-closing them
    pub shutdown_grace: Duration,

    /// Reconnect attempts after the engine disconnects unexpectedly
    pub reconnect_attempts: usize,

    pub reconnect_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: num_cpus::get().clamp(2, 8),
            shutdown_grace: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Capture protocol tuning
///
/// The scroll settings drive the full-page pass that triggers lazy-loaded and
/// intersection-observer content before the snapshot is taken.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Upper bound on navigation and snapshot (default: 30 seconds)
    pub navigation_timeout: Duration,

    /// Pixels scrolled per increment during the full-page pass
    pub scroll_step_px: u64,

    /// Pause between scroll increments
    pub scroll_delay: Duration,

    /// Pause after scrolling back to the top
    pub settle_delay: Duration,

    /// Hard cap on scroll increments for endlessly growing pages
    pub max_scroll_steps: usize,

    /// Largest caller-requested extra wait accepted
    pub max_extra_wait: Duration,

    pub output_format: OutputFormat,

    /// JPEG quality, 1-100 (only used for `OutputFormat::Jpeg`)
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            scroll_step_px: 600,
            scroll_delay: Duration::from_millis(100),
            settle_delay: Duration::from_millis(500),
            max_scroll_steps: 100,
            max_extra_wait: Duration::from_secs(10),
            output_format: OutputFormat::Png,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// Requested worker count; clamped below the pool ceiling at runtime
    pub workers: usize,
    pub default_max_pages: usize,
    pub max_pages_limit: usize,
    /// Deepest sitemap-index nesting that is still followed
    pub max_sitemap_depth: usize,
    pub fetch_timeout: Duration,
    pub user_agent: String,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            default_max_pages: 50,
            max_pages_limit: 500,
            max_sitemap_depth: 3,
            fetch_timeout: Duration::from_secs(15),
            user_agent: format!("site-capture/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub artifact_ttl: Duration,
    pub job_ttl: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            artifact_ttl: Duration::from_secs(24 * 60 * 60),
            job_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval: Duration,
    /// Maximum artifacts (and jobs) reclaimed per run
    pub batch_size: usize,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Limit applied when a caller's limit cannot be parsed
    pub default_spec: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_spec: "10/minute".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum StorageBackend {
    /// Everything lives in process memory and vanishes on exit
    #[default]
    Memory,
    /// Blobs are written below `root`; metadata stays in memory
    Filesystem { root: PathBuf },
}

/// Chrome launch settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads
    pub user_agent: Option<String>,

    /// Memory limit for the renderer in bytes
    pub memory_limit: Option<usize>,
}

/// Browser viewport dimensions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    /// Device pixel ratio; values > 1.0 simulate high-density displays
    pub device_scale_factor: f64,
    /// Enables mobile rendering behaviour and touch emulation
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        ViewportPreset::Desktop.viewport()
    }
}

/// Named viewport presets callers choose between
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewportPreset {
    #[default]
    Desktop,
    Mobile,
}

impl ViewportPreset {
    pub fn viewport(self) -> Viewport {
        match self {
            ViewportPreset::Desktop => Viewport {
                width: 1920,
                height: 1080,
                device_scale_factor: 1.0,
                mobile: false,
            },
            ViewportPreset::Mobile => Viewport {
                width: 390,
                height: 844,
                device_scale_factor: 2.0,
                mobile: true,
            },
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Some(ViewportPreset::Desktop),
            "mobile" => Some(ViewportPreset::Mobile),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViewportPreset::Desktop => "desktop",
            ViewportPreset::Mobile => "mobile",
        }
    }
}

/// Supported output image formats
///
/// - PNG: lossless, returned exactly as the engine produced it
/// - JPEG: lossy, re-encoded at `CaptureSettings::jpeg_quality`
/// - WebP: re-encoded losslessly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Some(OutputFormat::Png),
            "jpg" | "jpeg" => Some(OutputFormat::Jpeg),
            "webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }
}

/// Generate Chrome command-line arguments for headless capture
///
/// Every launch gets its own user-data and temp directories so a reconnect
/// never collides with the profile lock of a browser that is still exiting.
pub fn get_chrome_args(settings: &BrowserSettings, launch_id: &str) -> Vec<String> {
    let desktop = ViewportPreset::Desktop.viewport();
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!("--window-size={},{}", desktop.width, desktop.height),
        format!("--user-data-dir=/tmp/site-capture-profile-{launch_id}"),
        format!("--temp-dir=/tmp/site-capture-temp-{launch_id}"),
    ];

    if let Some(memory_limit) = settings.memory_limit {
        args.push(format!(
            "--js-flags=--max-old-space-size={}",
            memory_limit / 1024 / 1024
        ));
    }

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    settings: &BrowserSettings,
    launch_id: &str,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let desktop = ViewportPreset::Desktop.viewport();
    let mut builder = BrowserConfig::builder()
        .window_size(desktop.width, desktop.height)
        .args(get_chrome_args(settings, launch_id));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::Engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.pool.max_sessions >= 2);
        assert_eq!(config.crawl.max_sitemap_depth, 3);
        assert_eq!(config.capture.output_format, OutputFormat::Png);
    }

    #[test]
    fn crawl_workers_leave_pool_headroom() {
        let mut config = Config::default();
        config.pool.max_sessions = 4;
        config.crawl.workers = 10;
        assert_eq!(config.effective_crawl_workers(), 3);

        config.pool.max_sessions = 1;
        assert_eq!(config.effective_crawl_workers(), 1);

        config.pool.max_sessions = 8;
        config.crawl.workers = 0;
        assert_eq!(config.effective_crawl_workers(), 1);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"pool": {"max_sessions": 6}, "storage": {"backend": {"kind": "filesystem", "root": "/tmp/x"}}}"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_sessions, 6);
        assert_eq!(config.crawl.workers, 3);
        assert!(matches!(config.storage.backend, StorageBackend::Filesystem { .. }));
    }

    #[test]
    fn rejects_zero_ceiling() {
        let mut config = Config::default();
        config.pool.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn viewport_presets() {
        let mobile = ViewportPreset::Mobile.viewport();
        assert!(mobile.mobile);
        assert!(mobile.width < mobile.height);
        assert_eq!(Viewport::default(), ViewportPreset::Desktop.viewport());
        assert_eq!(ViewportPreset::parse("Mobile"), Some(ViewportPreset::Mobile));
        assert_eq!(ViewportPreset::parse("tablet"), None);
    }

    #[test]
    fn chrome_args_are_isolated_per_launch() {
        let args = get_chrome_args(&BrowserSettings::default(), "abc");
        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/site-capture-profile-abc".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--user-agent")));
    }
}
