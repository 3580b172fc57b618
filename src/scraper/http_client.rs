use super::{Fetched, Fetcher, Location};
use crate::config::ScraperConfig;
use crate::error::FetchError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Polite HTTP client: one attempt per request, a fixed pause before each.
pub struct HttpClient {
    inner: reqwest::Client,
    delay: Duration,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            delay: Duration::from_millis(config.request_delay_ms),
        })
    }

    async fn get(&self, url: &Url) -> Result<Fetched, FetchError> {
        self.polite_delay().await;
        debug!("GET {}", url);

        let transport = |reason| FetchError::Transport {
            url: url.to_string(),
            reason,
        };
        let resp = self.inner.get(url.clone()).send().await.map_err(transport)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            debug!("{} not published (404)", url);
            return Ok(Fetched::Absent);
        }
        if !status.is_success() {
            warn!("GET {} returned {}", url, status);
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(transport)?;
        debug!("{}: {} bytes", url, body.len());
        Ok(Fetched::Found(body.to_vec()))
    }

    async fn polite_delay(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

/// Read a local payload; a missing file is an unpublished period.
pub async fn read_local(path: &Path) -> Result<Fetched, FetchError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Fetched::Found(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist", path.display());
            Ok(Fetched::Absent)
        }
        Err(reason) => Err(FetchError::Io {
            path: path.display().to_string(),
            reason,
        }),
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, location: &Location) -> Result<Fetched, FetchError> {
        match location {
            Location::Url(url) => self.get(url).await,
            Location::Path(path) => read_local(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn quiet_config() -> ScraperConfig {
        ScraperConfig {
            request_delay_ms: 0,
            ..ScraperConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_files_are_read_or_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2022_areabalance_current_term.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"DATE,TIME\n").unwrap();

        let client = HttpClient::new(&quiet_config()).unwrap();
        let found = client.fetch(&Location::Path(path)).await.unwrap();
        assert_eq!(found, Fetched::Found(b"DATE,TIME\n".to_vec()));

        let missing = client
            .fetch(&Location::Path(dir.path().join("2031_areabalance_current_term.csv")))
            .await
            .unwrap();
        assert_eq!(missing, Fetched::Absent);
    }
}
