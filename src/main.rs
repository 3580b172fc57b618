mod config;
mod error;
mod loader;
mod models;
mod normalizer;
mod pipeline;
mod scraper;
mod sources;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::pipeline::Pipeline;
use crate::sources::SourceSpec;
use crate::storage::CsvStore;

#[derive(Parser)]
#[command(name = "grid-etl", about = "Electricity demand, supply and price ETL", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape and normalize sources (default: pipeline.sources, or all of them)
    Run {
        /// Source names, e.g. Hokkaido Kansai JEPX
        sources: Vec<String>,
    },

    /// Normalize already-downloaded files of one source
    Normalize {
        #[arg(short, long)]
        source: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Append the latest Hokkaido realtime observations
    Realtime,

    /// Append the latest day of JEPX spot prices
    DailyPrices,

    /// Rebuild the Vietnam generation table from PDF reports
    Generation {
        /// Directory containing the monthly PDF reports
        #[arg(short, long, default_value = "reports")]
        dir: PathBuf,
    },

    /// List known sources and the files they write
    Sources {
        #[arg(long)]
        json: bool,
    },

    /// Show row counts and date ranges of written outputs
    Stats,
}

fn select_sources(requested: &[String], config: &AppConfig) -> Result<Vec<SourceSpec>> {
    let names = if requested.is_empty() {
        &config.pipeline.sources
    } else {
        requested
    };
    if names.is_empty() {
        return Ok(sources::registry()?);
    }
    names
        .iter()
        .map(|n| sources::find(n).with_context(|| format!("Cannot select source {:?}", n)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "grid_etl=info,warn",
        1 => "grid_etl=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run { sources } => {
            let _t = utils::Timer::start("Source run");
            let specs = select_sources(&sources, &config)?;
            let stats = Pipeline::new(config)?.run(specs).await?;
            if stats.errors > 0 {
                anyhow::bail!("{} of {} sources failed", stats.errors, stats.sources_processed);
            }
        }

        Command::Normalize { source, files } => {
            let _t = utils::Timer::start(format!("Normalize {}", source));
            let spec = sources::find(&source)?;
            let report = Pipeline::new(config)?
                .normalize_files(&spec, &files)
                .await
                .with_context(|| format!("{} normalize failed", spec.name))?;
            info!("{}: {} rows written", report.name, report.rows_written);
        }

        Command::Realtime => {
            let _t = utils::Timer::start("Realtime update");
            let added = Pipeline::new(config)?.run_realtime().await?;
            info!("Done: {} new observations", added);
        }

        Command::DailyPrices => {
            let _t = utils::Timer::start("Daily price update");
            let added = Pipeline::new(config)?.run_daily_prices().await?;
            info!("Done: {} new price rows", added);
        }

        Command::Generation { dir } => {
            let _t = utils::Timer::start("Generation reports");
            let rows = Pipeline::new(config)?.run_generation(&dir).await?;
            info!("Done: {} monthly records", rows);
        }

        Command::Sources { json } => {
            let specs = sources::registry()?;
            if json {
                let listing: Vec<_> = specs
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "name": s.name,
                            "region": s.normalizer.profile().region,
                            "unit": s.normalizer.profile().units.unit,
                            "files": s.output_files(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                println!("{} sources:", specs.len());
                for s in &specs {
                    println!(
                        "  {:<10} {:<8} {}",
                        s.name,
                        s.normalizer.profile().units.unit,
                        s.output_files().join(", ")
                    );
                }
            }
        }

        Command::Stats => {
            let store = CsvStore::open(&config.output.dir)?;
            let files = store.stats()?;
            println!("─────────────────────────────────────────────────────────────");
            println!("  Grid ETL — Output Stats ({})", config.output.dir.display());
            println!("─────────────────────────────────────────────────────────────");
            if files.is_empty() {
                println!("  No output yet, run `grid-etl run` first.");
            }
            for f in &files {
                let span = |ts: Option<models::Timestamp>| ts.map(|t| t.to_string()).unwrap_or("—".into());
                println!(
                    "  {:<32} {:>10} rows  {} → {}",
                    f.file,
                    utils::fmt_number(f.rows),
                    span(f.first),
                    span(f.last)
                );
            }
            println!("─────────────────────────────────────────────────────────────");
        }
    }

    Ok(())
}
