use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP behaviour shared by every source
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause before every request.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Sources processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// First year polled by sources published one file per period.
    #[serde(default = "default_first_year")]
    pub first_year: i32,

    /// Sources a plain `run` covers; empty means all of them.
    #[serde(default)]
    pub sources: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_timeout_secs() -> u64 {
    60
}
fn default_request_delay_ms() -> u64 {
    1000
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:77.0) Gecko/20100101 Firefox/77.0".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_concurrency() -> usize {
    3
}
fn default_first_year() -> i32 {
    2016
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            request_delay_ms: default_request_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            first_year: default_first_year(),
            sources: Vec::new(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("GRID")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pipeline.sources")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pipeline.concurrency > 0, "pipeline.concurrency must be at least 1");
        anyhow::ensure!(
            (1990..=2100).contains(&self.pipeline.first_year),
            "pipeline.first_year {} is out of range",
            self.pipeline.first_year
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_sections_fall_back_to_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[pipeline]\nconcurrency = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.pipeline.concurrency, 5);
        assert_eq!(cfg.pipeline.first_year, 2016);
        assert_eq!(cfg.output.dir, PathBuf::from("output"));
        assert_eq!(cfg.scraper.request_delay_ms, 1000);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.concurrency = 0;
        assert!(cfg.validate().is_err());
        assert!(AppConfig::default().validate().is_ok());
    }
}
