//! Metrics recorded through the `metrics` facade.
//!
//! Nothing is collected unless a recorder is installed; the binary installs
//! the Prometheus exporter when started with `--metrics-port`.

use crate::{CaptureError, CrawlStatus, PoolStats, SweepReport};
use ::metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub const CAPTURES_TOTAL: &str = "captures_total";
pub const CAPTURE_DURATION_SECONDS: &str = "capture_duration_seconds";
pub const CRAWL_JOBS_TOTAL: &str = "crawl_jobs_total";
pub const SWEEPER_DELETED_TOTAL: &str = "sweeper_deleted_total";
pub const SWEEPER_EXPIRED_IN_PLACE_TOTAL: &str = "sweeper_expired_in_place_total";
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "rate_limit_rejections_total";
pub const POOL_ACTIVE_SESSIONS: &str = "pool_active_sessions";
pub const POOL_QUEUED_LEASES: &str = "pool_queued_leases";

pub fn describe() {
    describe_counter!(CAPTURES_TOTAL, "Captures attempted, labelled by outcome");
    describe_histogram!(
        CAPTURE_DURATION_SECONDS,
        Unit::Seconds,
        "Time from request to encoded image, including the wait for a session"
    );
    describe_counter!(CRAWL_JOBS_TOTAL, "Site crawl jobs finished, labelled by status");
    describe_counter!(SWEEPER_DELETED_TOTAL, "Expired artifacts reclaimed by the sweeper");
    describe_counter!(
        SWEEPER_EXPIRED_IN_PLACE_TOTAL,
        "Expired artifacts whose blob could not be deleted"
    );
    describe_counter!(RATE_LIMIT_REJECTIONS_TOTAL, "Requests rejected by the rate limiter");
    describe_gauge!(POOL_ACTIVE_SESSIONS, "Render sessions currently leased");
    describe_gauge!(POOL_QUEUED_LEASES, "Callers waiting for a render session");
}

/// `outcome` label for [`CAPTURES_TOTAL`].
pub fn capture_outcome<T>(result: &Result<T, CaptureError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    }
}

pub fn record_capture<T>(result: &Result<T, CaptureError>, elapsed: Duration) {
    counter!(CAPTURES_TOTAL, 1, "outcome" => capture_outcome(result));
    histogram!(CAPTURE_DURATION_SECONDS, elapsed.as_secs_f64());
}

pub fn record_pool_usage(stats: &PoolStats) {
    gauge!(POOL_ACTIVE_SESSIONS, stats.active as f64);
    gauge!(POOL_QUEUED_LEASES, stats.queued as f64);
}

pub fn record_crawl_finished(status: CrawlStatus) {
    let status = match status {
        CrawlStatus::Completed => "completed",
        CrawlStatus::Failed => "failed",
        CrawlStatus::Pending => "pending",
        CrawlStatus::Processing => "processing",
    };
    counter!(CRAWL_JOBS_TOTAL, 1, "status" => status);
}

pub fn record_sweep(report: &SweepReport) {
    counter!(SWEEPER_DELETED_TOTAL, report.deleted as u64);
    counter!(SWEEPER_EXPIRED_IN_PLACE_TOTAL, report.expired_in_place as u64);
}

pub fn record_rate_limited() {
    increment_counter!(RATE_LIMIT_REJECTIONS_TOTAL);
}

/// Serves `/metrics` in the Prometheus text format.
pub struct PrometheusExporter {
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }

    /// Install the global recorder and start the HTTP listener. Needs a running tokio runtime.
    pub fn start(&self) -> Result<(), metrics_exporter_prometheus::BuildError> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()?;
        describe();
        info!("Prometheus metrics available on http://{}/metrics", self.addr);
        Ok(())
    }
}
