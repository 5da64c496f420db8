//! # Site Capture
//!
//! Rendered-page screenshots for single URLs and for whole sites discovered
//! through their sitemap, driven by a bounded pool of headless Chrome
//! sessions.
//!
//! ## Pipeline
//!
//! ```text
//! caller -> RateLimiter::admit
//!        -> single URL: CapturePipeline -> SessionPool -> CaptureWorker
//!        -> site crawl: SitemapResolver -> SiteCrawler -> N x CapturePipeline
//!        -> MetadataStore + BlobStore <- ExpirySweeper
//! ```
//!
//! - **Session pool**: a fixed ceiling of concurrently leased render sessions,
//!   FIFO queueing beyond it, and reconnection after the browser goes away.
//! - **Capture protocol**: viewport, reduced motion, navigation, a stylesheet
//!   that forces animated and lazily revealed content visible, an optional
//!   full-page scroll pass, then the snapshot.
//! - **Site crawls**: sitemap discovery (hint, well-known paths, robots.txt),
//!   recursive sitemap index resolution, and a worker group with live
//!   progress counters.
//! - **Retention**: artifacts and jobs expire; a sweeper reclaims them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use site_capture::{CaptureRequest, CaptureService, Config, SiteCrawlRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = CaptureService::new(Config::default()).await?;
//!
//!     let artifact = service
//!         .submit_capture(CaptureRequest::new("https://example.com"))
//!         .await?;
//!     println!("Captured {} bytes", artifact.size_bytes);
//!
//!     let ack = service
//!         .submit_site_crawl(SiteCrawlRequest::new("https://example.com"))
//!         .await?;
//!     println!("Crawling {} pages as job {}", ack.total_pages, ack.job_id);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! site-capture capture --url https://example.com --output example.png --full-page
//! site-capture crawl --url https://example.com --max-pages 20 --output captures/
//! site-capture --storage-dir ./store sweep
//! site-capture validate config.json
//! ```

/// Configuration and settings
pub mod config;

/// Error types
pub mod error;

/// Requests, artifacts, site jobs and sitemap entries
pub mod models;

/// Render engine capability traits
pub mod engine;

/// Headless Chrome render engine
pub mod chrome;

/// Bounded pool of render sessions
pub mod session_pool;

/// Capture protocol and image encoding
pub mod capture;

/// Sitemap discovery and resolution
pub mod sitemap;

/// Site crawl orchestration
pub mod crawl;

/// Per-caller sliding-window rate limiting
pub mod rate_limit;

/// Periodic reclamation of expired artifacts and jobs
pub mod sweeper;

/// Metadata and blob stores
pub mod storage;

/// Service facade
pub mod service;

/// Health checks over the service probes
pub mod health;

/// Metrics collection and the Prometheus exporter
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod test_support;


pub use capture::*;
pub use chrome::*;
pub use cli::*;
pub use config::*;
pub use crawl::*;
pub use engine::*;
pub use error::*;
pub use health::*;
pub use crate::metrics::PrometheusExporter;
pub use models::*;
pub use rate_limit::*;
pub use service::*;
pub use session_pool::*;
pub use sitemap::*;
pub use storage::*;
pub use sweeper::*;
pub use utils::*;
