//! Sitemap discovery and flattening
//!
//! Discovery walks a fixed candidate list and accepts the first location that
//! answers. Collection flattens sitemap indexes depth-first over an explicit
//! work stack, so hostile nesting can never grow the call stack.

use crate::utils::{site_root, validate_url};
use crate::{CrawlSettings, SitemapError, SitemapUrlEntry};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use url::Url;

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq)]
pub enum SitemapDocument {
    /// `<sitemapindex>`: locations of further sitemaps
    Index(Vec<String>),
    /// `<urlset>`: page entries
    UrlSet(Vec<SitemapUrlEntry>),
}

/// Flattened page list plus everything that went wrong along the way.
#[derive(Debug, Default)]
pub struct SitemapCollection {
    /// In first-discovered order, de-duplicated, never longer than the budget
    pub entries: Vec<SitemapUrlEntry>,
    pub errors: Vec<SitemapError>,
}

pub struct SitemapResolver {
    client: Client,
    max_depth: usize,
}

impl SitemapResolver {
    pub fn new(settings: &CrawlSettings) -> Result<Self, SitemapError> {
        let client = Client::builder()
            .timeout(settings.fetch_timeout)
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            max_depth: settings.max_sitemap_depth,
        })
    }

    /// Find the sitemap for the site behind `base_url`.
    ///
    /// Candidates, in order: `hint`, `/sitemap.xml`, `/sitemap_index.xml`,
    /// then every `Sitemap:` line of `/robots.txt`.
    pub async fn discover(&self, base_url: &str, hint: Option<&str>) -> Result<String, SitemapError> {
        let base = validate_url(base_url).map_err(|e| SitemapError::Fetch {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let root = site_root(&base);
        let mut tried = Vec::new();

        let mut candidates = Vec::new();
        if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
            match root.join(hint) {
                Ok(url) => candidates.push(url),
                Err(_) => tried.push(hint.to_string()),
            }
        }
        for path in ["sitemap.xml", "sitemap_index.xml"] {
            if let Ok(url) = root.join(path) {
                candidates.push(url);
            }
        }

        for candidate in candidates {
            tried.push(candidate.to_string());
            if self.probe(&candidate).await {
                info!(sitemap = %candidate, "Sitemap discovered");
                return Ok(candidate.to_string());
            }
        }

        if let Ok(robots) = root.join("robots.txt") {
            tried.push(robots.to_string());
            match self.fetch_text(robots.as_str()).await {
                Ok(body) => {
                    for declared in robots_sitemaps(&body) {
                        let Ok(candidate) = root.join(&declared) else {
                            tried.push(declared);
                            continue;
                        };
                        tried.push(candidate.to_string());
                        if self.probe(&candidate).await {
                            info!(sitemap = %candidate, "Sitemap discovered via robots.txt");
                            return Ok(candidate.to_string());
                        }
                    }
                }
                Err(e) => debug!("robots.txt unavailable: {}", e),
            }
        }

        Err(SitemapError::NotFound { tried })
    }

    /// Flatten `sitemap_url` into at most `max_pages` entries.
    ///
    /// A branch that fails to fetch or parse, or that nests deeper than the
    /// configured limit, is recorded in `errors` and skipped; its siblings
    /// are still followed.
    pub async fn collect(&self, sitemap_url: &str, max_pages: usize) -> SitemapCollection {
        let mut collection = SitemapCollection::default();
        let mut seen_locs = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(sitemap_url.to_string(), 0usize)];

        while let Some((url, depth)) = stack.pop() {
            if collection.entries.len() >= max_pages {
                break;
            }
            if depth > self.max_depth {
                warn!(sitemap = %url, depth, "Sitemap nested too deep, skipping");
                collection.errors.push(SitemapError::DepthExceeded { url, depth });
                continue;
            }
            if !visited.insert(url.clone()) {
                debug!(sitemap = %url, "Sitemap already visited");
                continue;
            }

            let body = match self.fetch_text(&url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("{}", e);
                    collection.errors.push(e);
                    continue;
                }
            };

            match Self::parse(&url, &body) {
                Ok(SitemapDocument::Index(children)) => {
                    debug!(sitemap = %url, children = children.len(), "Sitemap index");
                    // Reversed so the leftmost child is popped first
                    for child in children.into_iter().rev() {
                        stack.push((child, depth + 1));
                    }
                }
                Ok(SitemapDocument::UrlSet(entries)) => {
                    for entry in entries {
                        if collection.entries.len() >= max_pages {
                            break;
                        }
                        if seen_locs.insert(entry.loc.clone()) {
                            collection.entries.push(entry);
                        }
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    collection.errors.push(e);
                }
            }
        }

        info!(
            sitemap = %sitemap_url,
            pages = collection.entries.len(),
            errors = collection.errors.len(),
            "Sitemap collected"
        );
        collection
    }

    /// Parse one sitemap document fetched from `url`.
    pub fn parse(url: &str, xml: &str) -> Result<SitemapDocument, SitemapError> {
        let parse_error = |reason: String| SitemapError::Parse {
            url: url.to_string(),
            reason,
        };

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut kind: Option<DocumentKind> = None;
        let mut depth = 0usize;
        let mut field: Option<Field> = None;
        let mut current: Option<PartialEntry> = None;
        let mut children = Vec::new();
        let mut entries = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    depth += 1;
                    let name = e.local_name();
                    // Only direct children of an entry count, so extension
                    // elements like <image:loc> never leak into the page loc
                    match (depth, name.as_ref()) {
                        (1, b"sitemapindex") => kind = Some(DocumentKind::Index),
                        (1, b"urlset") => kind = Some(DocumentKind::UrlSet),
                        (1, other) => {
                            return Err(parse_error(format!(
                                "unexpected root element <{}>",
                                String::from_utf8_lossy(other)
                            )));
                        }
                        (2, b"sitemap" | b"url") => current = Some(PartialEntry::default()),
                        (3, b"loc") => field = Some(Field::Loc),
                        (3, b"lastmod") => field = Some(Field::Lastmod),
                        (3, b"priority") => field = Some(Field::Priority),
                        _ => field = None,
                    }
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| parse_error(e.to_string()))?;
                    if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                        entry.push(field, &text);
                    }
                }
                Ok(Event::CData(data)) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                        entry.push(field, &text);
                    }
                }
                Ok(Event::End(e)) => {
                    let name = e.local_name();
                    match (depth, name.as_ref()) {
                        (2, b"sitemap" | b"url") => {
                            if let Some(entry) = current.take() {
                                match kind {
                                    Some(DocumentKind::Index) => children.extend(entry.into_loc()),
                                    Some(DocumentKind::UrlSet) => entries.extend(entry.into_entry()),
                                    None => {}
                                }
                            }
                        }
                        (3, _) => field = None,
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(parse_error(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        match kind {
            Some(DocumentKind::Index) => Ok(SitemapDocument::Index(children)),
            Some(DocumentKind::UrlSet) => Ok(SitemapDocument::UrlSet(entries)),
            None => Err(parse_error("document has no root element".to_string())),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, SitemapError> {
        let fetch_error = |reason: String| SitemapError::Fetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {status}")));
        }

        response.text().await.map_err(|e| fetch_error(e.to_string()))
    }

    /// Lightweight existence check: HEAD, falling back to GET for servers that refuse HEAD.
    async fn probe(&self, url: &Url) -> bool {
        let status = match self.client.head(url.clone()).send().await {
            Ok(response) => response.status(),
            Err(e) => {
                debug!(url = %url, "HEAD failed: {}", e);
                return false;
            }
        };

        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            return match self.client.get(url.clone()).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!(url = %url, "GET failed: {}", e);
                    false
                }
            };
        }

        status.is_success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DocumentKind {
    Index,
    UrlSet,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Loc,
    Lastmod,
    Priority,
}

#[derive(Default)]
struct PartialEntry {
    loc: String,
    lastmod: String,
    priority: String,
}

impl PartialEntry {
    fn push(&mut self, field: Field, text: &str) {
        match field {
            Field::Loc => self.loc.push_str(text),
            Field::Lastmod => self.lastmod.push_str(text),
            Field::Priority => self.priority.push_str(text),
        }
    }

    fn into_loc(self) -> Option<String> {
        let loc = self.loc.trim();
        (!loc.is_empty()).then(|| loc.to_string())
    }

    fn into_entry(self) -> Option<SitemapUrlEntry> {
        let loc = self.loc.trim();
        if loc.is_empty() {
            return None;
        }
        let lastmod = self.lastmod.trim();
        Some(SitemapUrlEntry {
            loc: loc.to_string(),
            lastmod: (!lastmod.is_empty()).then(|| lastmod.to_string()),
            priority: self.priority.trim().parse().ok(),
        })
    }
}

/// Values of every `Sitemap:` directive in a robots.txt body.
pub fn robots_sitemaps(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or("").trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
        .collect()
}
