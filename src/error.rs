use std::time::Duration;
use thiserror::Error;

/// Failures of a single capture. Surfaced per URL and never fatal to a batch.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Render engine error: {0}")]
    Engine(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    #[error("Image encoding failed: {0}")]
    Encoding(String),

    #[error("Render session pool is closing")]
    PoolShuttingDown,
}

impl CaptureError {
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::InvalidUrl(_) => "invalid_url",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::Navigation(_) => "navigation",
            CaptureError::Engine(_) => "engine",
            CaptureError::Snapshot(_) => "snapshot",
            CaptureError::Encoding(_) => "encoding",
            CaptureError::PoolShuttingDown => "pool_shutting_down",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SitemapError {
    #[error("No sitemap found, tried: {}", tried.join(", "))]
    NotFound { tried: Vec<String> },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Failed to parse {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Sitemap {url} nested too deep (depth {depth})")]
    DepthExceeded { url: String, depth: usize },

    #[error("Sitemap {url} lists no pages")]
    Empty { url: String },
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Error taxonomy exposed to callers of [`crate::CaptureService`].
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Sitemap(#[from] SitemapError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Render session pool is shutting down")]
    PoolShuttingDown,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service is not accepting new work")]
    NotAccepting,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Whether the caller supplied something wrong, as opposed to a fault on our side.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::NotFound(_)
                | ServiceError::RateLimitExceeded { .. }
                | ServiceError::Capture(CaptureError::InvalidUrl(_))
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SitemapError {
    fn from(err: reqwest::Error) -> Self {
        SitemapError::Fetch {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_shutdown_is_lifted_into_capture_variant() {
        let err: ServiceError = CaptureError::PoolShuttingDown.into();
        assert!(matches!(err, ServiceError::Capture(CaptureError::PoolShuttingDown)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn not_found_lists_every_candidate() {
        let err = SitemapError::NotFound {
            tried: vec![
                "https://a.test/sitemap.xml".to_string(),
                "https://a.test/robots.txt".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("https://a.test/sitemap.xml"));
        assert!(msg.contains("https://a.test/robots.txt"));
    }

    #[test]
    fn client_errors() {
        assert!(ServiceError::Validation("bad".into()).is_client_error());
        assert!(ServiceError::RateLimitExceeded { retry_after_secs: 1 }.is_client_error());
        assert!(!ServiceError::Storage(StorageError::Io("disk".into())).is_client_error());
        assert_eq!(CaptureError::Timeout(Duration::from_secs(1)).kind(), "timeout");
    }
}
