//! Pipeline orchestrator: ties fetcher → normalizer → storage together.
//!
//! ## Run modes
//!
//! `run()`: every selected source is an independent task,
//!   bounded by `pipeline.concurrency`. Within a source, periods are fetched
//!   one after another, combined, normalized, and written in one commit.
//!   A failing source is logged and counted; the others carry on.
//!
//! `run_realtime()` / `run_daily_prices()`: append the latest observations
//!   to their logs, skipping rows already present.
//!
//! `run_generation()`: re-derive the monthly generation table from a
//!   directory of PDF reports.

use crate::config::AppConfig;
use crate::error::{FetchError, PipelineError, PipelineResult};
use crate::loader::{PayloadLayout, SHIFT_JIS, decode_text, discover_files};
use crate::models::{GenerationRecord, RawTable};
use crate::normalizer::TableKind;
use crate::normalizer::combine::{Combiner, PeriodDescriptor, PeriodOutcome};
use crate::scraper::http_client::HttpClient;
use crate::scraper::parsers::{parse_generation_report, parse_realtime};
use crate::scraper::{Fetched, Fetcher, Location};
use crate::sources::{self, Discovery, SourceSpec};
use crate::storage::CsvStore;
use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use url::Url;

pub const REALTIME_FILE: &str = "Realtime_Hokkaido_Data.csv";
pub const GENERATION_FILE: &str = "Vietnam_Generation_Data.csv";

/// What one source run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceReport {
    pub name: String,
    pub rows_written: usize,
    pub absent_periods: Vec<String>,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub sources_processed: usize,
    pub rows_written: usize,
    /// Sources with nothing published yet.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<AppConfig>,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<CsvStore>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let fetcher = HttpClient::new(&config.scraper).context("Failed to build HTTP client")?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    pub fn with_fetcher(config: AppConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let store = CsvStore::open(&config.output.dir)?;
        Ok(Self {
            config: Arc::new(config),
            fetcher,
            store: Arc::new(store),
        })
    }

    #[cfg(test)]
    fn store(&self) -> &CsvStore {
        &self.store
    }

    fn current_year() -> i32 {
        Local::now().year()
    }

    /// Period files of a source, in publication order.
    async fn descriptors(&self, spec: &SourceSpec, first_year: i32) -> PipelineResult<Vec<PeriodDescriptor>> {
        match &spec.discovery {
            Discovery::Templated { template, .. } => {
                let Some(scheme) = spec.discovery.scheme(first_year, Self::current_year()) else {
                    return Ok(Vec::new());
                };
                Ok(scheme.descriptors(template).collect::<Result<Vec<_>, FetchError>>()?)
            }
            Discovery::Index { page, rule } => {
                let page = Url::parse(page).map_err(|e| FetchError::Location {
                    location: page.clone(),
                    message: e.to_string(),
                })?;
                let links = self.fetcher.discover(&page, rule).await?;
                info!("{}: {} files listed on {}", spec.name, links.len(), page);
                Ok(links
                    .into_iter()
                    .map(|url| {
                        let location = Location::Url(url);
                        PeriodDescriptor::new(location.file_name(), location)
                    })
                    .collect())
            }
        }
    }

    /// Fetch every period sequentially and concatenate what was found.
    async fn collect(
        &self,
        feed: &str,
        layout: &PayloadLayout,
        periods: Vec<PeriodDescriptor>,
    ) -> PipelineResult<(RawTable, Vec<String>)> {
        let mut combiner = Combiner::new(feed);
        for period in periods {
            let outcome = match self.fetcher.fetch(&period.location).await? {
                Fetched::Found(bytes) => PeriodOutcome::Found(layout.decode(&bytes, &period.label)?),
                Fetched::Absent => PeriodOutcome::Absent,
            };
            combiner.push(&period.label, outcome)?;
        }
        let absent = combiner.absent().to_vec();
        Ok((combiner.finish()?, absent))
    }

    /// Normalize a combined table and write the source's output files.
    fn write_source(&self, spec: &SourceSpec, table: &RawTable) -> PipelineResult<usize> {
        match spec.kind() {
            TableKind::Balance => {
                let tables = spec.normalizer.normalize(table)?;
                let with_supply = !spec.demand_only();
                self.store.write_canonical(spec.name, &tables, with_supply)?;
                Ok(tables.demand.len() + if with_supply { tables.supply.len() } else { 0 })
            }
            TableKind::Price => {
                let prices = spec.normalizer.normalize_prices(table)?;
                self.store.write_table(&format!("{}_Price_Data.csv", spec.name), &prices)
            }
        }
    }

    /// Fetch, normalize and write one source.
    pub async fn run_source(&self, spec: &SourceSpec) -> PipelineResult<SourceReport> {
        let periods = self.descriptors(spec, self.config.pipeline.first_year).await?;
        let (table, absent_periods) = self.collect(spec.name, &spec.layout, periods).await?;
        let rows_written = self.write_source(spec, &table)?;
        Ok(SourceReport {
            name: spec.name.to_string(),
            rows_written,
            absent_periods,
        })
    }

    /// Normalize local files of a known source instead of downloading them.
    pub async fn normalize_files(&self, spec: &SourceSpec, files: &[PathBuf]) -> PipelineResult<SourceReport> {
        let periods = files
            .iter()
            .map(|path| {
                let location = Location::Path(path.clone());
                PeriodDescriptor::new(location.file_name(), location)
            })
            .collect();
        let (table, absent_periods) = self.collect(spec.name, &spec.layout, periods).await?;
        let rows_written = self.write_source(spec, &table)?;
        Ok(SourceReport {
            name: spec.name.to_string(),
            rows_written,
            absent_periods,
        })
    }

    /// Run every given source as its own task.
    pub async fn run(&self, specs: Vec<SourceSpec>) -> Result<PipelineStats> {
        let sem = Arc::new(Semaphore::new(self.config.pipeline.concurrency));
        let mut handles = Vec::new();

        for spec in specs {
            let pipeline = self.clone();
            let sem = Arc::clone(&sem);
            let name = spec.name;

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;
                let report = pipeline
                    .run_source(&spec)
                    .await
                    .with_context(|| format!("{} run failed", spec.name))?;
                if !report.absent_periods.is_empty() {
                    info!("{}: skipped unpublished {}", report.name, report.absent_periods.join(", "));
                }
                Ok::<SourceReport, anyhow::Error>(report)
            });

            handles.push((name, handle));
        }

        let mut stats = PipelineStats::default();
        for (name, handle) in handles {
            stats.sources_processed += 1;
            match handle.await {
                Ok(Ok(report)) => {
                    info!("{}: {} rows written", name, report.rows_written);
                    stats.rows_written += report.rows_written;
                }
                Ok(Err(e)) if e.downcast_ref::<PipelineError>().is_some_and(PipelineError::is_recoverable) => {
                    warn!("{:#}", e);
                    stats.skipped += 1;
                }
                Ok(Err(e)) => {
                    error!("{:#}", e);
                    stats.errors += 1;
                }
                Err(e) => {
                    error!("Task panic for {}: {}", name, e);
                    stats.errors += 1;
                }
            }
        }

        info!(
            "=== Done: {} sources | {} rows | {} skipped | {} errors ===",
            stats.sources_processed, stats.rows_written, stats.skipped, stats.errors
        );
        Ok(stats)
    }

    /// Append the latest hourly and 5-minute Hokkaido observations.
    pub async fn run_realtime(&self) -> Result<usize> {
        let page = Url::parse(sources::REALTIME_PAGE)?;
        let links = self.fetcher.discover(&page, &sources::realtime_rule()).await?;
        let csv_url = links
            .into_iter()
            .next()
            .with_context(|| format!("no realtime CSV link on {}", page))?;

        let location = Location::Url(csv_url);
        let bytes = match self.fetcher.fetch(&location).await? {
            Fetched::Found(bytes) => bytes,
            Fetched::Absent => anyhow::bail!("realtime CSV {} is not available", location),
        };
        let origin = location.file_name();
        let text = decode_text(&bytes, SHIFT_JIS, &origin);
        let observations = parse_realtime(&text, &origin)?;

        Ok(self.store.append_dedup(REALTIME_FILE, observations)?)
    }

    /// Append the last day of the current year's spot prices.
    pub async fn run_daily_prices(&self) -> Result<usize> {
        let spec = sources::jepx_daily()?;
        let periods = self.descriptors(&spec, Self::current_year()).await?;
        let (table, _) = self.collect(spec.name, &spec.layout, periods).await?;
        let prices = spec.normalizer.normalize_prices(&table)?;
        let file = format!("{}_Price_Data.csv", spec.name);
        Ok(self.store.append_dedup(&file, prices)?)
    }

    /// Rebuild the Vietnam monthly generation table from PDF reports in `dir`.
    pub async fn run_generation(&self, dir: &Path) -> Result<usize> {
        let files = discover_files(dir, "pdf")?;
        if files.is_empty() {
            warn!("No PDF reports in {:?}", dir);
            return Ok(0);
        }
        info!("Found {} PDF reports in {:?}", files.len(), dir);

        let mut records: Vec<GenerationRecord> = Vec::with_capacity(files.len());
        for path in files {
            let location = Location::Path(path);
            let origin = location.file_name();
            let bytes = match self.fetcher.fetch(&location).await? {
                Fetched::Found(bytes) => bytes,
                Fetched::Absent => continue,
            };
            let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| PipelineError::Pdf {
                origin: origin.clone(),
                message: e.to_string(),
            })?;
            records.push(parse_generation_report(&text, &origin)?);
        }

        let records = newest_months_first(records);
        Ok(self.store.write_table(GENERATION_FILE, &records)?)
    }
}

/// One record per month, later reports superseding earlier ones, newest first.
fn newest_months_first(records: Vec<GenerationRecord>) -> Vec<GenerationRecord> {
    let mut by_month = std::collections::BTreeMap::new();
    for rec in records {
        by_month.insert((rec.year, rec.month), rec);
    }
    by_month.into_values().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DemandRecord, PriceRecord, RealtimeObservation, SupplyRecord};
    use crate::normalizer::Normalizer;
    use crate::normalizer::combine::Granularity;
    use crate::normalizer::schema::{ColumnMapping, ColumnRole};
    use crate::normalizer::timestamp::TimeShape;
    use crate::normalizer::units::UnitConversion;
    use crate::scraper::LinkRule;
    use crate::scraper::memory::MemoryFetcher;
    use crate::loader::UTF_8;

    const HEADER: &str = "DATE,TIME,DEMAND,NUCLEAR,SOLAR\n";

    fn config(dir: &Path, first_year: i32) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.output.dir = dir.to_path_buf();
        cfg.pipeline.first_year = first_year;
        cfg.scraper.request_delay_ms = 0;
        cfg
    }

    fn normalizer(feed: &str) -> Normalizer {
        Normalizer::builder(feed)
            .mapping(ColumnMapping::positional([
                ColumnRole::Date,
                ColumnRole::Clock,
                ColumnRole::Demand,
                ColumnRole::series("Nuclear"),
                ColumnRole::series("Solar"),
            ]))
            .time(TimeShape::date_clock("%Y/%m/%d"))
            .units(UnitConversion::new(10.0, "MWh"))
            .build()
            .unwrap()
    }

    fn quarterly(name: &'static str) -> SourceSpec {
        SourceSpec {
            name,
            discovery: Discovery::Templated {
                template: "https://example.com/{year}_{quarter}q.csv".into(),
                granularity: Granularity::Quarter,
            },
            layout: PayloadLayout::csv(UTF_8),
            normalizer: normalizer(name),
        }
    }

    fn indexed(name: &'static str) -> SourceSpec {
        SourceSpec {
            name,
            discovery: Discovery::Index {
                page: "https://example.com/download.html".into(),
                rule: LinkRule::new("a.csv"),
            },
            layout: PayloadLayout::csv(UTF_8),
            normalizer: normalizer(name),
        }
    }

    fn pipeline(fetcher: MemoryFetcher, dir: &Path, first_year: i32) -> (Pipeline, Arc<MemoryFetcher>) {
        let fetcher = Arc::new(fetcher);
        let p = Pipeline::with_fetcher(config(dir, first_year), fetcher.clone()).unwrap();
        (p, fetcher)
    }

    #[tokio::test]
    async fn test_missing_quarter_is_skipped() {
        let year = Pipeline::current_year();
        let url = |q: u8| format!("https://example.com/{}_{}q.csv", year, q);
        let fetcher = MemoryFetcher::new()
            .with(&url(1), format!("{}{}/04/01,01:00,100,20,5\n", HEADER, year))
            .with(&url(2), format!("{}{}/07/01,01:00,110,21,6\n", HEADER, year))
            .with(&url(4), format!("{}{}/01/01,01:00,120,22,7\n", HEADER, year));
        let dir = tempfile::tempdir().unwrap();
        let (p, fetcher) = pipeline(fetcher, dir.path(), year);

        let report = p.run_source(&quarterly("Test")).await.unwrap();
        assert_eq!(report.absent_periods, vec![format!("{}Q3", year)]);
        assert_eq!(report.rows_written, 3 + 6);

        // fetched one period at a time, in order
        assert_eq!(fetcher.requested(), (1..=4).map(url).collect::<Vec<_>>());

        let demand: Vec<DemandRecord> = p.store().read_all("Test_Demand_Data.csv").unwrap();
        let values: Vec<f64> = demand.iter().map(|d| d.area_demand).collect();
        assert_eq!(values, vec![1100.0, 1000.0, 1200.0]);
    }

    #[tokio::test]
    async fn test_index_source_with_every_link_absent_writes_nothing() {
        let fetcher = MemoryFetcher::new().with(
            "https://example.com/download.html",
            r#"<a class="csv" href="data/2020.csv">2020</a>"#,
        );
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(fetcher, dir.path(), 2016);

        let err = p.run_source(&indexed("Test")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingPeriod { .. }));
        assert!(!p.store().path("Test_Demand_Data.csv").exists());
    }

    #[tokio::test]
    async fn test_schema_change_aborts_the_source() {
        let fetcher = MemoryFetcher::new()
            .with(
                "https://example.com/download.html",
                r#"<a class="csv" href="a.csv">a</a><a class="csv" href="b.csv">b</a>"#,
            )
            .with("https://example.com/a.csv", format!("{}2022/04/01,01:00,100,20,5\n", HEADER))
            .with(
                "https://example.com/b.csv",
                "DATE,TIME,DEMAND,NUCLEAR,SOLAR,WIND\n2022/05/01,01:00,100,20,5,1\n",
            );
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(fetcher, dir.path(), 2016);

        match p.run_source(&indexed("Test")).await.unwrap_err() {
            PipelineError::SchemaMismatch { origin, .. } => assert_eq!(origin, "b.csv"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.store().stats().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_source_does_not_stop_the_others() {
        let year = Pipeline::current_year();
        let good = MemoryFetcher::new()
            .with(
                "https://example.com/download.html",
                r#"<a class="csv" href="a.csv">a</a>"#,
            )
            .with("https://example.com/a.csv", format!("{}2022/04/01,01:00,100,20,5\n", HEADER))
            .failing(&format!("https://example.com/{}_1q.csv", year), 500);
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(good, dir.path(), year);

        let mut unpublished = quarterly("Later");
        unpublished.discovery = Discovery::Templated {
            template: "https://example.com/later/{year}.csv".into(),
            granularity: Granularity::Year,
        };

        let stats = p
            .run(vec![indexed("Good"), quarterly("Bad"), unpublished])
            .await
            .unwrap();
        assert_eq!(stats.sources_processed, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.skipped, 1);
        assert!(p.store().path("Good_Supply_Data.csv").exists());
        assert!(!p.store().path("Bad_Demand_Data.csv").exists());
    }

    #[test]
    fn test_local_files_normalize_like_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        let first = input.join("2021.csv");
        let second = input.join("2022.csv");
        std::fs::write(&first, format!("{}2021/04/01,01:00,100,20,5\n", HEADER)).unwrap();
        std::fs::write(&second, format!("{}2022/04/01,01:00,100,,5\n", HEADER)).unwrap();

        let p = Pipeline::new(config(&dir.path().join("out"), 2016)).unwrap();

        let report = tokio_test::block_on(p.normalize_files(&quarterly("Local"), &[first, second])).unwrap();
        assert_eq!(report.rows_written, 2 + 4);

        let supply: Vec<SupplyRecord> = p.store().read_all("Local_Supply_Data.csv").unwrap();
        assert_eq!(supply[0].fuel_type, "Solar");
        assert_eq!(supply[1].supply, None);
    }

    #[tokio::test]
    async fn test_realtime_append_is_idempotent() {
        let csv = "DATE,TIME,実績,予測,使用率,供給力\n2022/7/1,0:00,300,305,75,400\n\nDATE,TIME,実績5分,太陽光\n2022/7/1,0:05,299,1\n";
        let (bytes, _, _) = SHIFT_JIS.encode(csv);
        let fetcher = MemoryFetcher::new()
            .with(
                sources::REALTIME_PAGE,
                r#"<a class="ic_csv" href="data/juyo_hokkaido.csv">CSV</a>"#,
            )
            .with("http://denkiyoho.hepco.co.jp/data/juyo_hokkaido.csv", bytes.into_owned());
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(fetcher, dir.path(), 2016);

        assert_eq!(p.run_realtime().await.unwrap(), 6);
        assert_eq!(p.run_realtime().await.unwrap(), 0);

        let log: Vec<RealtimeObservation> = p.store().read_all(REALTIME_FILE).unwrap();
        assert_eq!(log.len(), 6);
    }

    #[tokio::test]
    async fn test_daily_prices_append_last_slots() {
        let year = Pipeline::current_year();
        let mut csv = String::from("年月日,時刻コード,システムプライス(円/kWh)");
        for jp in ["北海道", "東北", "東京", "中部", "北陸", "関西", "中国", "四国", "九州"] {
            csv.push_str(&format!(",エリアプライス{}(円/kWh)", jp));
        }
        csv.push('\n');
        for day in 1..=2 {
            for slot in 1..=48 {
                csv.push_str(&format!("{}/01/0{},{},10.0,11,11,11,11,11,11,11,11,11\n", year, day, slot));
            }
        }
        let (bytes, _, _) = SHIFT_JIS.encode(&csv);
        let fetcher = MemoryFetcher::new().with(
            &format!("http://www.jepx.org/market/excel/spot_{}.csv", year),
            bytes.into_owned(),
        );
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(fetcher, dir.path(), 2016);

        // 48 slots of the last day, 10 areas each
        assert_eq!(p.run_daily_prices().await.unwrap(), 480);
        assert_eq!(p.run_daily_prices().await.unwrap(), 0);

        let prices: Vec<PriceRecord> = p.store().read_all("JEPX_Daily_Price_Data.csv").unwrap();
        assert!(prices.iter().all(|r| r.date_time.day() == 2));
    }

    #[tokio::test]
    async fn test_generation_without_reports_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (p, _) = pipeline(MemoryFetcher::new(), dir.path(), 2016);
        assert_eq!(p.run_generation(&dir.path().join("reports")).await.unwrap(), 0);
        assert!(!p.store().path(GENERATION_FILE).exists());
    }

    #[test]
    fn test_generation_months_sorted_newest_first() {
        let rec = |year, month, generation| GenerationRecord {
            year,
            month,
            country: "Vietnam".into(),
            generation,
            unit: "MWh".into(),
        };
        let out = newest_months_first(vec![rec(2020, 12, 1.0), rec(2021, 2, 2.0), rec(2020, 12, 3.0)]);
        assert_eq!(out, vec![rec(2021, 2, 2.0), rec(2020, 12, 3.0)]);
    }
}
