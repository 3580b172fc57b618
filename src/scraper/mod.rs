pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::error::FetchError;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;
use url::Url;

// ── Locations ─────────────────────────────────────────────────────────────────

/// Where a payload lives: a remote URL or a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Url(Url),
    Path(PathBuf),
}

impl Location {
    /// `http(s)://` strings become URLs, anything else a local path.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Url::parse(raw).map(Location::Url).map_err(|e| FetchError::Location {
                location: raw.to_string(),
                message: e.to_string(),
            })
        } else if raw.is_empty() {
            Err(FetchError::Location {
                location: String::new(),
                message: "empty location".into(),
            })
        } else {
            Ok(Location::Path(PathBuf::from(raw)))
        }
    }

    /// Last path segment, used as the origin label of a fetched table.
    pub fn file_name(&self) -> String {
        let name = match self {
            Location::Url(url) => url
                .path_segments()
                .and_then(|mut s| s.next_back())
                .map(str::to_string),
            Location::Path(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
        };
        name.filter(|n| !n.is_empty()).unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Url(url) => f.write_str(url.as_str()),
            Location::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

// ── Link discovery ────────────────────────────────────────────────────────────

/// Which anchors on an index page point at data files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRule {
    /// CSS selector matching the anchors.
    pub selector: String,
    /// Only search inside the n-th element matching this selector.
    pub container: Option<(String, usize)>,
    /// Matching links to ignore from the start of the page.
    pub skip: usize,
    pub href_contains: Option<String>,
}

impl LinkRule {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            container: None,
            skip: 0,
            href_contains: None,
        }
    }

    pub fn within(mut self, container: &str, index: usize) -> Self {
        self.container = Some((container.to_string(), index));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn href_containing(mut self, needle: &str) -> Self {
        self.href_contains = Some(needle.to_string());
        self
    }
}

// ── Fetcher trait ─────────────────────────────────────────────────────────────

/// Outcome of a single fetch. A payload that is not published is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Found(Vec<u8>),
    Absent,
}

/// Swappable source of raw bytes; the normalizer never talks to the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, location: &Location) -> Result<Fetched, FetchError>;

    /// Resolve the data links on an index page, in page order.
    async fn discover(&self, page: &Url, rule: &LinkRule) -> Result<Vec<Url>, FetchError> {
        let bytes = match self.fetch(&Location::Url(page.clone())).await? {
            Fetched::Found(bytes) => bytes,
            Fetched::Absent => {
                return Err(FetchError::Status {
                    url: page.to_string(),
                    status: 404,
                });
            }
        };
        let html = String::from_utf8_lossy(&bytes);
        let links = parsers::extract_links(&html, page, rule)?;
        debug!("{}: {} links match {:?}", page, links.len(), rule.selector);
        Ok(links)
    }
}

// ── In-memory fetcher for tests ───────────────────────────────────────────────
