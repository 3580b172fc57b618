use thiserror::Error;

/// Failure to obtain raw bytes for a source or period.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("GET {url} failed: {reason}")]
    Transport {
        url: String,
        #[source]
        reason: reqwest::Error,
    },

    #[error("could not read {path}: {reason}")]
    Io {
        path: String,
        #[source]
        reason: std::io::Error,
    },

    #[error("invalid location {location}: {message}")]
    Location { location: String, message: String },

    #[error("could not read links from {url}: {message}")]
    Page { url: String, message: String },
}

/// A single row whose date/time fields could not be fused into a timestamp.
///
/// Row-scoped: the normalizer drops and counts the row, so this never
/// becomes a [`PipelineError`].
#[derive(Debug, Clone, Error, PartialEq)]
#[error("row {row}: cannot parse timestamp from {value:?}")]
pub struct TimestampParseError {
    pub row: usize,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{feed}: schema mismatch in {origin}: {detail}")]
    SchemaMismatch {
        feed: String,
        origin: String,
        detail: String,
    },

    #[error("{feed}: period {period} is not published")]
    MissingPeriod { feed: String, period: String },

    #[error("{feed}: no rows survived timestamp parsing ({dropped} dropped)")]
    NoUsableRows { feed: String, dropped: usize },

    #[error("invalid profile for {feed}: {message}")]
    Config { feed: String, message: String },

    #[error("{origin}: {message}")]
    Payload { origin: String, message: String },

    #[error("{origin}: cannot read workbook: {message}")]
    Excel { origin: String, message: String },

    #[error("{origin}: cannot extract pdf text: {message}")]
    Pdf { origin: String, message: String },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn payload(origin: &str, message: impl Into<String>) -> Self {
        Self::Payload {
            origin: origin.to_string(),
            message: message.into(),
        }
    }

    pub fn schema(feed: &str, origin: &str, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            feed: feed.to_string(),
            origin: origin.to_string(),
            detail: detail.into(),
        }
    }

    /// True for the one condition a run may skip past.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingPeriod { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
