//! Multi-period combination: sources that publish one file per year, fiscal
//! quarter or month are fetched period by period and concatenated here.

use crate::error::{FetchError, PipelineError, PipelineResult};
use crate::models::RawTable;
use crate::scraper::Location;
use tracing::{debug, info};

/// A source-defined time-scoped file.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodDescriptor {
    pub label: String,
    pub location: Location,
}

impl PeriodDescriptor {
    pub fn new(label: impl Into<String>, location: Location) -> Self {
        Self {
            label: label.into(),
            location,
        }
    }
}

/// Result of looking for one period. A period that is not published yet is
/// expected steady state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodOutcome {
    Found(RawTable),
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Year,
    /// Japanese fiscal quarters: Q1 = April..June.
    Quarter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodKey {
    pub year: i32,
    pub quarter: Option<u8>,
}

impl PeriodKey {
    pub fn label(&self) -> String {
        match self.quarter {
            Some(q) => format!("{}Q{}", self.year, q),
            None => self.year.to_string(),
        }
    }

    /// Substitute `{year}` and `{quarter}` in a URL or path template.
    pub fn expand(&self, template: &str) -> String {
        let out = template.replace("{year}", &self.year.to_string());
        match self.quarter {
            Some(q) => out.replace("{quarter}", &q.to_string()),
            None => out,
        }
    }
}

/// An inclusive range of periods, enumerated lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodScheme {
    pub first_year: i32,
    pub last_year: i32,
    pub granularity: Granularity,
}

impl PeriodScheme {
    pub fn keys(&self) -> impl Iterator<Item = PeriodKey> + use<> {
        let quarters: &'static [u8] = match self.granularity {
            Granularity::Year => &[0],
            Granularity::Quarter => &[1, 2, 3, 4],
        };
        (self.first_year..=self.last_year).flat_map(move |year| {
            quarters.iter().map(move |&q| PeriodKey {
                year,
                quarter: (q > 0).then_some(q),
            })
        })
    }

    /// Descriptors for a `{year}`/`{quarter}` template, one per period.
    pub fn descriptors<'t>(
        &self,
        template: &'t str,
    ) -> impl Iterator<Item = Result<PeriodDescriptor, FetchError>> + use<'t> {
        self.keys().map(move |key| {
            let location = Location::parse(&key.expand(template))?;
            Ok(PeriodDescriptor::new(key.label(), location))
        })
    }
}

fn is_blank(cell: Option<&String>) -> bool {
    cell.is_none_or(|c| c.trim().is_empty())
}

/// Drop trailing columns that carry neither a header nor any value.
pub fn trim_blank_trailing_columns(table: &mut RawTable) {
    let full = table
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(table.header.len()))
        .max()
        .unwrap_or(0);

    let mut width = full;
    while width > 0 {
        let col = width - 1;
        let blank = is_blank(table.header.get(col)) && table.rows.iter().all(|r| is_blank(r.get(col)));
        if !blank {
            break;
        }
        width -= 1;
    }

    table.header.truncate(width);
    for row in &mut table.rows {
        row.truncate(width);
    }
}

/// Accumulates period tables in arrival order.
pub struct Combiner<'f> {
    feed: &'f str,
    table: Option<RawTable>,
    found: Vec<String>,
    absent: Vec<String>,
}

impl<'f> Combiner<'f> {
    pub fn new(feed: &'f str) -> Self {
        Self {
            feed,
            table: None,
            found: Vec::new(),
            absent: Vec::new(),
        }
    }

    pub fn push(&mut self, period: &str, outcome: PeriodOutcome) -> PipelineResult<()> {
        let mut incoming = match outcome {
            PeriodOutcome::Absent => {
                info!("{}: period {} not published, skipping", self.feed, period);
                self.absent.push(period.to_string());
                return Ok(());
            }
            PeriodOutcome::Found(t) => t,
        };
        trim_blank_trailing_columns(&mut incoming);
        debug!("{}: period {} has {} rows", self.feed, period, incoming.rows.len());

        match &mut self.table {
            None => self.table = Some(incoming),
            Some(acc) => {
                if acc.width() != incoming.width() {
                    return Err(PipelineError::schema(
                        self.feed,
                        period,
                        format!(
                            "{} columns, earlier periods have {}",
                            incoming.width(),
                            acc.width()
                        ),
                    ));
                }
                acc.rows.append(&mut incoming.rows);
            }
        }
        self.found.push(period.to_string());
        Ok(())
    }

    pub fn absent(&self) -> &[String] {
        &self.absent
    }

    /// The concatenated table; fails only when no period was found at all.
    pub fn finish(self) -> PipelineResult<RawTable> {
        let mut table = self.table.ok_or_else(|| PipelineError::MissingPeriod {
            feed: self.feed.to_string(),
            period: if self.absent.is_empty() {
                "(none listed)".to_string()
            } else {
                self.absent.join(", ")
            },
        })?;
        table.origin = match self.found.as_slice() {
            [only] => only.clone(),
            [first, .., last] => format!("{}..{}", first, last),
            [] => String::new(),
        };
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combine(feed: &str, periods: Vec<(String, PeriodOutcome)>) -> PipelineResult<RawTable> {
        let mut combiner = Combiner::new(feed);
        for (label, outcome) in periods {
            combiner.push(&label, outcome)?;
        }
        combiner.finish()
    }

    fn period(label: &str, rows: &[&[&str]]) -> (String, PeriodOutcome) {
        let table = RawTable::new(
            label,
            vec!["Date".into(), "Time".into(), "Demand".into()],
            rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect(),
        );
        (label.to_string(), PeriodOutcome::Found(table))
    }

    #[test]
    fn test_missing_period_is_skipped_without_gap_filling() {
        let periods = vec![
            period("P1", &[&["2022/01/01", "00:00", "1"]]),
            period("P2", &[&["2022/02/01", "00:00", "2"], &["2022/02/01", "01:00", "3"]]),
            ("P3".to_string(), PeriodOutcome::Absent),
            period("P4", &[&["2022/04/01", "00:00", "4"]]),
        ];
        let table = combine("Test", periods).unwrap();
        assert_eq!(table.rows.len(), 4);
        let demand: Vec<&str> = table.rows.iter().map(|r| r[2].as_str()).collect();
        assert_eq!(demand, vec!["1", "2", "3", "4"]);
        assert_eq!(table.origin, "P1..P4");
    }

    #[test]
    fn test_all_absent_is_missing_period() {
        let err = combine("Test", vec![("2030".to_string(), PeriodOutcome::Absent)]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingPeriod { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_width_change_between_periods_is_rejected() {
        let wide = RawTable::new(
            "P2",
            vec!["Date".into(), "Time".into(), "Demand".into(), "Nuclear".into()],
            vec![vec!["2022/02/01".into(), "00:00".into(), "2".into(), "1".into()]],
        );
        let err = combine(
            "Test",
            vec![period("P1", &[&["2022/01/01", "00:00", "1"]]), ("P2".into(), PeriodOutcome::Found(wide))],
        )
        .unwrap_err();
        match err {
            PipelineError::SchemaMismatch { origin, .. } => assert_eq!(origin, "P2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_trailing_blank_columns_are_trimmed() {
        let mut table = RawTable::new(
            "2021",
            vec!["Date".into(), "Demand".into(), "".into()],
            vec![vec!["2021/04/01 00:00".into(), "5".into(), "".into(), " ".into()]],
        );
        trim_blank_trailing_columns(&mut table);
        assert_eq!(table.width(), 2);
        assert_eq!(table.rows[0].len(), 2);
    }

    #[test]
    fn test_quarter_scheme_expands_templates() {
        let scheme = PeriodScheme {
            first_year: 2016,
            last_year: 2017,
            granularity: Granularity::Quarter,
        };
        let keys: Vec<String> = scheme.keys().map(|k| k.label()).collect();
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[0], "2016Q1");
        assert_eq!(keys[7], "2017Q4");

        let first = scheme
            .descriptors("https://example.com/sup_dem_results_{year}_{quarter}q.csv")
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(
            first.location.to_string(),
            "https://example.com/sup_dem_results_2016_1q.csv"
        );
    }
}
