//! Requests, stored records and their lifecycles.

use crate::ViewportPreset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to capture one URL. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureRequest {
    pub url: String,
    #[serde(default)]
    pub viewport: ViewportPreset,
    #[serde(default)]
    pub full_page: bool,
    #[serde(default)]
    pub extra_wait_ms: u64,
    #[serde(default)]
    pub site_job_id: Option<Uuid>,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            viewport: ViewportPreset::default(),
            full_page: false,
            extra_wait_ms: 0,
            site_job_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

/// A stored screenshot plus its metadata
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureArtifact {
    pub id: Uuid,
    pub url: String,
    pub blob_key: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored image bytes
    pub checksum: String,
    pub viewport: ViewportPreset,
    pub full_page: bool,
    pub site_job_id: Option<Uuid>,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CaptureArtifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Input for [`crate::MetadataStore::create_artifact`]; the store assigns id and `created_at`.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub url: String,
    pub blob_key: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub viewport: ViewportPreset,
    pub full_page: bool,
    pub site_job_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub status: Option<ArtifactStatus>,
    pub site_job_id: Option<Uuid>,
    /// Only artifacts whose `expires_at` is at or before this instant
    pub expires_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ArtifactFilter {
    pub fn matches(&self, artifact: &CaptureArtifact) -> bool {
        if let Some(status) = self.status {
            if artifact.status != status {
                return false;
            }
        }
        if let Some(job_id) = self.site_job_id {
            if artifact.site_job_id != Some(job_id) {
                return false;
            }
        }
        if let Some(cutoff) = self.expires_before {
            if !artifact.is_expired_at(cutoff) {
                return false;
            }
        }
        true
    }
}

/// Site crawl lifecycle: `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CrawlStatus::Completed | CrawlStatus::Failed)
    }

    /// Strictly forward-only; terminal states accept nothing.
    pub fn can_transition_to(self, next: CrawlStatus) -> bool {
        matches!(
            (self, next),
            (CrawlStatus::Pending, CrawlStatus::Processing)
                | (CrawlStatus::Pending, CrawlStatus::Failed)
                | (CrawlStatus::Processing, CrawlStatus::Completed)
                | (CrawlStatus::Processing, CrawlStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SiteCrawlJob {
    pub id: Uuid,
    pub root_url: String,
    pub sitemap_url: String,
    pub total_pages: usize,
    pub captured_count: usize,
    pub failed_count: usize,
    pub status: CrawlStatus,
    pub viewport: ViewportPreset,
    pub full_page: bool,
    /// Soft errors collected while resolving the sitemap
    pub sitemap_errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl SiteCrawlJob {
    pub fn processed(&self) -> usize {
        self.captured_count + self.failed_count
    }
}

#[derive(Debug, Clone)]
pub struct NewSiteJob {
    pub root_url: String,
    pub sitemap_url: String,
    pub total_pages: usize,
    pub status: CrawlStatus,
    pub viewport: ViewportPreset,
    pub full_page: bool,
    pub sitemap_errors: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SiteCrawlRequest {
    pub url: String,
    #[serde(default)]
    pub sitemap_url: Option<String>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub viewport: ViewportPreset,
    #[serde(default)]
    pub full_page: bool,
    #[serde(default)]
    pub extra_wait_ms: u64,
}

impl SiteCrawlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sitemap_url: None,
            max_pages: None,
            viewport: ViewportPreset::default(),
            full_page: false,
            extra_wait_ms: 0,
        }
    }
}

/// Immediate answer to a crawl submission; the crawl itself continues in the background.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SiteCrawlAck {
    pub job_id: Uuid,
    pub sitemap_url: String,
    pub total_pages: usize,
    pub sitemap_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SitemapUrlEntry {
    pub loc: String,
    pub lastmod: Option<String>,
    pub priority: Option<f32>,
}

impl SitemapUrlEntry {
    pub fn new(loc: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            lastmod: None,
            priority: None,
        }
    }

    /// Path component used to order a crawl deterministically.
    pub fn sort_key(&self) -> (String, String) {
        let path = url::Url::parse(&self.loc)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.loc.clone());
        (path, self.loc.clone())
    }
}

/// Sort entries by URL path, falling back to the full URL to break ties.
pub fn sort_by_path(entries: &mut [SitemapUrlEntry]) {
    entries.sort_by_cached_key(|e| e.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_cutoff_is_inclusive() {
        let now = Utc::now();
        let artifact = CaptureArtifact {
            id: Uuid::new_v4(),
            url: "https://a.test/".to_string(),
            blob_key: "captures/a.png".to_string(),
            content_type: "image/png".to_string(),
            size_bytes: 1,
            checksum: String::new(),
            viewport: ViewportPreset::Desktop,
            full_page: false,
            site_job_id: None,
            status: ArtifactStatus::Completed,
            created_at: now - chrono::Duration::minutes(5),
            expires_at: now,
        };
        assert!(artifact.is_expired_at(now));
        assert!(!artifact.is_expired_at(now - chrono::Duration::seconds(1)));

        let due = ArtifactFilter {
            expires_before: Some(now),
            ..Default::default()
        };
        assert!(due.matches(&artifact));
        let early = ArtifactFilter {
            expires_before: Some(now - chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!early.matches(&artifact));
    }

    #[test]
    fn crawl_status_is_forward_only() {
        use CrawlStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn sorts_by_path_not_host() {
        let mut entries = vec![
            SitemapUrlEntry::new("https://a.test/zeta"),
            SitemapUrlEntry::new("https://b.test/alpha"),
            SitemapUrlEntry::new("https://a.test/"),
            SitemapUrlEntry::new("https://a.test/alpha"),
        ];
        sort_by_path(&mut entries);
        let locs: Vec<_> = entries.iter().map(|e| e.loc.as_str()).collect();
        assert_eq!(
            locs,
            vec![
                "https://a.test/",
                "https://a.test/alpha",
                "https://b.test/alpha",
                "https://a.test/zeta",
            ]
        );
    }

    #[test]
    fn capture_request_defaults_from_json() {
        let request: CaptureRequest =
            serde_json::from_str(r#"{"url": "https://a.test", "viewport": "mobile"}"#).unwrap();
        assert_eq!(request.viewport, ViewportPreset::Mobile);
        assert!(!request.full_page);
        assert_eq!(request.extra_wait_ms, 0);
        assert!(request.site_job_id.is_none());
    }
}
