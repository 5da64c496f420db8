use crate::{CaptureService, PoolStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub database: HealthLevel,
    pub storage: HealthLevel,
    pub render_engine: HealthLevel,
    pub pool: PoolStats,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct SystemHealthChecker {
    service: Arc<CaptureService>,
    last_check: Option<Instant>,
}

impl SystemHealthChecker {
    pub fn new(service: Arc<CaptureService>) -> Self {
        Self {
            service,
            last_check: None,
        }
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }

    pub async fn check_system_health(&mut self) -> HealthStatus {
        let start_time = Instant::now();

        let database = self.check_database_health().await;
        let storage = self.check_storage_health().await;
        let (render_engine, pool) = self.check_render_engine_health();

        let overall = determine_overall_health(&[database, storage, render_engine]);

        self.last_check = Some(start_time);
        info!(
            "Health check completed in {:?}: {:?}",
            start_time.elapsed(),
            overall
        );

        HealthStatus {
            overall,
            database,
            storage,
            render_engine,
            pool,
            timestamp: chrono::Utc::now(),
        }
    }

    async fn check_database_health(&self) -> HealthLevel {
        if self.service.is_database_healthy().await {
            HealthLevel::Healthy
        } else {
            error!("Metadata store health critical");
            HealthLevel::Critical
        }
    }

    async fn check_storage_health(&self) -> HealthLevel {
        if self.service.is_storage_healthy().await {
            HealthLevel::Healthy
        } else {
            error!("Blob store health critical");
            HealthLevel::Critical
        }
    }

    fn check_render_engine_health(&self) -> (HealthLevel, PoolStats) {
        let (healthy, stats) = self.service.is_render_engine_healthy();
        (pool_health(healthy, &stats), stats)
    }

    /// Log a health summary every `period` until `shutdown` flips to true.
    pub async fn run_periodic(&mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let status = self.check_system_health().await;
            match status.overall {
                HealthLevel::Healthy => info!("System health: OK"),
                HealthLevel::Warning => warn!(
                    "System health: WARNING - database: {:?}, storage: {:?}, render engine: {:?}, active {}/{} queued {}",
                    status.database, status.storage, status.render_engine,
                    status.pool.active, status.pool.ceiling, status.pool.queued
                ),
                HealthLevel::Critical => error!(
                    "System health: CRITICAL - database: {:?}, storage: {:?}, render engine: {:?}",
                    status.database, status.storage, status.render_engine
                ),
            }
        }
    }
}

fn pool_health(healthy: bool, stats: &PoolStats) -> HealthLevel {
    if !healthy {
        warn!(
            connected = stats.connected,
            shutting_down = stats.shutting_down,
            "Render engine health critical"
        );
        return HealthLevel::Critical;
    }

    // Saturated with callers waiting
    if stats.active >= stats.ceiling && stats.queued > 0 {
        warn!(
            "Render pool saturated: {}/{} active, {} queued",
            stats.active, stats.ceiling, stats.queued
        );
        return HealthLevel::Warning;
    }

    HealthLevel::Healthy
}

fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
    if levels.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if levels.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}
