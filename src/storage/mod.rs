use crate::error::PipelineResult;
use crate::models::{CanonicalTables, LogKey, Timestamp};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Row count and time span of one written file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileStats {
    pub file: String,
    pub rows: usize,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
}

/// Flat-file output directory. Every write goes to a temp file that is
/// renamed into place, so readers never see a half-written table.
pub struct CsvStore {
    dir: PathBuf,
}

impl CsvStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Could not create output dir {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn temp_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!(".{}.tmp", file))
    }

    fn stage<T: Serialize>(&self, file: &str, records: &[T]) -> PipelineResult<PathBuf> {
        let tmp = self.temp_path(file);
        let written = (|| -> PipelineResult<()> {
            let mut writer = csv::Writer::from_path(&tmp)?;
            for record in records {
                writer.serialize(record)?;
            }
            writer.flush()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(tmp)
    }

    /// Stage every table first, then move them all into place. Nothing is
    /// renamed unless every table staged cleanly. Each rename is atomic but
    /// the set is not: a failed rename leaves earlier files replaced, which
    /// is logged, and removes every remaining temp file.
    fn commit(&self, staged: Vec<PipelineResult<(PathBuf, &str)>>) -> PipelineResult<()> {
        let mut ready = Vec::with_capacity(staged.len());
        let mut failure = None;
        for item in staged {
            match item {
                Ok(pair) => ready.push(pair),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            for (tmp, _) in &ready {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }
        let mut pending = ready.into_iter();
        let mut replaced = Vec::new();
        while let Some((tmp, file)) = pending.next() {
            if let Err(e) = fs::rename(&tmp, self.path(file)) {
                let _ = fs::remove_file(&tmp);
                for (rest, _) in pending.by_ref() {
                    let _ = fs::remove_file(rest);
                }
                if !replaced.is_empty() {
                    error!(
                        "{} could not be replaced after {} was; the files no longer match",
                        file,
                        replaced.join(", ")
                    );
                }
                return Err(e.into());
            }
            debug!("wrote {}", file);
            replaced.push(file);
        }
        Ok(())
    }

    /// Replace `file` with `records`.
    pub fn write_table<T: Serialize>(&self, file: &str, records: &[T]) -> PipelineResult<usize> {
        let staged = self.stage(file, records).map(|tmp| (tmp, file));
        self.commit(vec![staged])?;
        info!("{}: {} rows", file, records.len());
        Ok(records.len())
    }

    /// Write the demand table, and the supply table unless the source is
    /// demand only. Neither is written unless both staged cleanly.
    pub fn write_canonical(&self, source: &str, tables: &CanonicalTables, with_supply: bool) -> PipelineResult<()> {
        let demand_file = format!("{}_Demand_Data.csv", source);
        let supply_file = format!("{}_Supply_Data.csv", source);

        let mut staged = vec![self.stage(&demand_file, &tables.demand).map(|t| (t, demand_file.as_str()))];
        if with_supply {
            staged.push(self.stage(&supply_file, &tables.supply).map(|t| (t, supply_file.as_str())));
        }
        self.commit(staged)?;

        info!(
            "{}: wrote {} demand rows{}",
            source,
            tables.demand.len(),
            if with_supply {
                format!(", {} supply rows", tables.supply.len())
            } else {
                String::new()
            }
        );
        Ok(())
    }

    pub fn read_all<T: DeserializeOwned>(&self, file: &str) -> PipelineResult<Vec<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let mut out = Vec::new();
        for record in reader.deserialize() {
            out.push(record?);
        }
        Ok(out)
    }

    /// Append records whose key is not in the log yet. Returns how many
    /// were added; re-appending the same batch adds nothing.
    pub fn append_dedup<T>(&self, file: &str, records: Vec<T>) -> PipelineResult<usize>
    where
        T: LogKey + Serialize + DeserializeOwned,
    {
        let mut log: Vec<T> = self.read_all(file)?;
        let mut seen: HashSet<(Timestamp, String)> = log.iter().map(LogKey::log_key).collect();

        let before = log.len();
        log.extend(records.into_iter().filter(|r| seen.insert(r.log_key())));
        let added = log.len() - before;

        if added == 0 {
            info!("{}: nothing new", file);
            return Ok(0);
        }
        let staged = self.stage(file, &log).map(|tmp| (tmp, file));
        self.commit(vec![staged])?;
        info!("{}: appended {} rows ({} total)", file, added, log.len());
        Ok(added)
    }

    /// Summaries of every CSV in the output directory, sorted by name.
    pub fn stats(&self) -> PipelineResult<Vec<FileStats>> {
        let mut out = Vec::new();
        for path in crate::loader::discover_files(&self.dir, "csv")? {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            out.push(file_stats(&path, file)?);
        }
        Ok(out)
    }
}

fn file_stats(path: &Path, file: String) -> PipelineResult<FileStats> {
    let mut reader = csv::Reader::from_path(path)?;
    let date_col = reader.headers()?.iter().position(|h| h == "Date_Time");

    let mut rows = 0usize;
    let mut first: Option<Timestamp> = None;
    let mut last: Option<Timestamp> = None;
    for record in reader.records() {
        let record = record?;
        rows += 1;
        let Some(ts) = date_col
            .and_then(|i| record.get(i))
            .and_then(|v| NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S").ok())
        else {
            continue;
        };
        first = Some(first.map_or(ts, |f| f.min(ts)));
        last = Some(last.map_or(ts, |l| l.max(ts)));
    }
    Ok(FileStats { file, rows, first, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DemandRecord, RealtimeObservation, SupplyRecord};

    fn ts(s: &str) -> Timestamp {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    fn tables() -> CanonicalTables {
        CanonicalTables {
            demand: vec![DemandRecord {
                date_time: ts("2022-04-01 01:00"),
                region: "Test".into(),
                unit: "MWh".into(),
                area_demand: 1000.0,
            }],
            supply: vec![
                SupplyRecord {
                    date_time: ts("2022-04-01 01:00"),
                    region: "Test".into(),
                    unit: "MWh".into(),
                    fuel_type: "Solar".into(),
                    supply: None,
                },
                SupplyRecord {
                    date_time: ts("2022-04-01 01:00"),
                    region: "Test".into(),
                    unit: "MWh".into(),
                    fuel_type: "Nuclear".into(),
                    supply: Some(200.0),
                },
            ],
        }
    }

    fn observation(time: &str, data_type: &str, value: f64) -> RealtimeObservation {
        RealtimeObservation {
            date_time: ts(time),
            region: "Hokkaido".into(),
            data_type: data_type.into(),
            unit: "MW".into(),
            value,
        }
    }

    #[test]
    fn test_canonical_files_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        store.write_canonical("Test", &tables(), true).unwrap();

        let demand = fs::read_to_string(store.path("Test_Demand_Data.csv")).unwrap();
        assert_eq!(
            demand,
            "Date_Time,Region,Unit,Area_Demand\n2022-04-01 01:00:00,Test,MWh,1000.0\n"
        );
        let supply = fs::read_to_string(store.path("Test_Supply_Data.csv")).unwrap();
        let lines: Vec<&str> = supply.lines().collect();
        assert_eq!(lines[0], "Date_Time,Region,Unit,Fuel_Type,Supply");
        assert_eq!(lines[1], "2022-04-01 01:00:00,Test,MWh,Solar,");

        // no temp files left behind
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_rewrite_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        store.write_canonical("Test", &tables(), true).unwrap();
        let first = fs::read(store.path("Test_Supply_Data.csv")).unwrap();
        store.write_canonical("Test", &tables(), true).unwrap();
        assert_eq!(first, fs::read(store.path("Test_Supply_Data.csv")).unwrap());
    }

    #[test]
    fn test_demand_only_skips_supply_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        store.write_canonical("Tokyo", &tables(), false).unwrap();
        assert!(store.path("Tokyo_Demand_Data.csv").exists());
        assert!(!store.path("Tokyo_Supply_Data.csv").exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        // a non-empty directory where the supply file should go
        let blocker = store.path("Test_Supply_Data.csv");
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(store.write_canonical("Test", &tables(), true).is_err());
        assert!(store.path("Test_Demand_Data.csv").exists());
        assert!(!store.temp_path("Test_Supply_Data.csv").exists());
        assert!(!store.temp_path("Test_Demand_Data.csv").exists());
    }

    #[test]
    fn test_append_dedup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let file = "Realtime_Hokkaido_Data.csv";
        let batch = vec![
            observation("2022-07-01 10:00", "Hourly Performance", 3000.0),
            observation("2022-07-01 10:00", "Hourly Usage Rate", 75.0),
        ];

        assert_eq!(store.append_dedup(file, batch.clone()).unwrap(), 2);
        assert_eq!(store.append_dedup(file, batch).unwrap(), 0);

        let next = vec![
            observation("2022-07-01 10:00", "Hourly Performance", 3000.0),
            observation("2022-07-01 11:00", "Hourly Performance", 3100.0),
        ];
        assert_eq!(store.append_dedup(file, next).unwrap(), 1);

        let log: Vec<RealtimeObservation> = store.read_all(file).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].value, 3100.0);
    }

    #[test]
    fn test_stats_reports_rows_and_span() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let mut t = tables();
        let older = DemandRecord {
            date_time: ts("2021-04-01 00:00"),
            ..t.demand[0].clone()
        };
        t.demand.push(older);
        store.write_canonical("Test", &t, true).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].file, "Test_Demand_Data.csv");
        assert_eq!(stats[0].rows, 2);
        assert_eq!(stats[0].first, Some(ts("2021-04-01 00:00")));
        assert_eq!(stats[0].last, Some(ts("2022-04-01 01:00")));
    }
}
