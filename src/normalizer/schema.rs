//! Schema reconciliation: map a source's raw columns onto canonical roles.

use crate::error::{PipelineError, PipelineResult};
use crate::models::RawTable;
use crate::scraper::cleaner::clean_field;
use tracing::debug;

/// Canonical meaning of one raw column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRole {
    /// Calendar date, e.g. `2022/04/01`.
    Date,
    /// Time of day: `01:00` or an hour label such as `9時`.
    Clock,
    /// Date and time in a single field.
    DateTime,
    /// Half-hour slot code (1..=48).
    Slot,
    /// The area demand quantity (`Area_Demand`).
    Demand,
    /// A supply fuel type or a price area, by output label.
    Series(String),
    /// Present in the file, never emitted.
    Skip,
}

impl ColumnRole {
    pub fn series(label: impl Into<String>) -> Self {
        Self::Series(label.into())
    }

    pub fn is_time_component(&self) -> bool {
        matches!(self, Self::Date | Self::Clock | Self::DateTime | Self::Slot)
    }
}

#[derive(Debug, Clone)]
enum Selection {
    Positional(Vec<ColumnRole>),
    ByHeader(Vec<(String, ColumnRole)>),
}

/// How a source's columns map onto canonical roles.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    selection: Selection,
    excluded_headers: Vec<String>,
    blank_padding: bool,
}

impl ColumnMapping {
    /// Roles by column position, after excluded headers are removed.
    pub fn positional(roles: impl IntoIterator<Item = ColumnRole>) -> Self {
        Self {
            selection: Selection::Positional(roles.into_iter().collect()),
            excluded_headers: Vec::new(),
            blank_padding: false,
        }
    }

    /// Roles by exact header name; unnamed columns are ignored.
    pub fn by_header<S: Into<String>>(pairs: impl IntoIterator<Item = (S, ColumnRole)>) -> Self {
        Self {
            selection: Selection::ByHeader(pairs.into_iter().map(|(h, r)| (h.into(), r)).collect()),
            excluded_headers: Vec::new(),
            blank_padding: false,
        }
    }

    /// Drop a known non-data column (e.g. a precomputed total) by header name.
    pub fn excluding(mut self, header: impl Into<String>) -> Self {
        self.excluded_headers.push(header.into());
        self
    }

    /// Accept extra trailing columns as long as every cell in them is blank.
    pub fn allow_blank_padding(mut self) -> Self {
        self.blank_padding = true;
        self
    }

    /// Every configured role, in column order.
    pub fn roles(&self) -> Vec<&ColumnRole> {
        match &self.selection {
            Selection::Positional(roles) => roles.iter().collect(),
            Selection::ByHeader(pairs) => pairs.iter().map(|(_, r)| r).collect(),
        }
    }

    pub fn count(&self, role: &ColumnRole) -> usize {
        self.roles().into_iter().filter(|r| *r == role).count()
    }

    pub fn series_labels(&self) -> Vec<String> {
        self.roles()
            .into_iter()
            .filter_map(|r| match r {
                ColumnRole::Series(label) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }
}

/// One surviving row: fields aligned with [`ReconciledTable::roles`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRow {
    /// Position of the row in the raw table.
    pub line: usize,
    pub fields: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledTable {
    pub roles: Vec<ColumnRole>,
    pub rows: Vec<ReconciledRow>,
    pub dropped_empty: usize,
}

impl ReconciledTable {
    pub fn position(&self, role: &ColumnRole) -> Option<usize> {
        self.roles.iter().position(|r| r == role)
    }
}

fn clean_header(h: &str) -> String {
    h.trim().trim_start_matches('\u{feff}').trim().to_string()
}

/// Resolve which raw column feeds each emitted role.
fn select_columns(
    mapping: &ColumnMapping,
    table: &RawTable,
    feed: &str,
) -> PipelineResult<(Vec<(usize, ColumnRole)>, Vec<usize>)> {
    let header: Vec<String> = table.header.iter().map(|h| clean_header(h)).collect();

    match &mapping.selection {
        Selection::Positional(roles) => {
            let remaining: Vec<usize> = header
                .iter()
                .enumerate()
                .filter(|(_, h)| !mapping.excluded_headers.iter().any(|x| x == *h))
                .map(|(i, _)| i)
                .collect();

            let expected = roles.len();
            let found = remaining.len();
            let padding = if found == expected {
                Vec::new()
            } else if found > expected && mapping.blank_padding {
                remaining[expected..].to_vec()
            } else {
                return Err(PipelineError::schema(
                    feed,
                    &table.origin,
                    format!("expected {} columns, found {} ({:?})", expected, found, header),
                ));
            };

            let selected = remaining
                .iter()
                .zip(roles.iter())
                .filter(|(_, role)| **role != ColumnRole::Skip)
                .map(|(i, role)| (*i, role.clone()))
                .collect();
            Ok((selected, padding))
        }
        Selection::ByHeader(pairs) => {
            let mut selected = Vec::with_capacity(pairs.len());
            for (name, role) in pairs {
                let idx = header.iter().position(|h| h == name).ok_or_else(|| {
                    PipelineError::schema(feed, &table.origin, format!("missing column {:?}", name))
                })?;
                if *role != ColumnRole::Skip {
                    selected.push((idx, role.clone()));
                }
            }
            Ok((selected, Vec::new()))
        }
    }
}

/// Apply the mapping: drop wholly-empty rows, drop excluded columns, turn
/// placeholder tokens into missing values, and reject rows whose shape does
/// not match the header.
pub fn reconcile(
    table: &RawTable,
    mapping: &ColumnMapping,
    placeholders: &[String],
    feed: &str,
) -> PipelineResult<ReconciledTable> {
    let (selected, padding) = select_columns(mapping, table, feed)?;
    let width = table.width();
    let positional = matches!(mapping.selection, Selection::Positional(_));
    let needed = selected.iter().map(|(i, _)| i + 1).max().unwrap_or(0);

    let mut rows = Vec::with_capacity(table.rows.len());
    let mut dropped_empty = 0usize;

    for (line, raw) in table.rows.iter().enumerate() {
        if raw.iter().all(|cell| clean_field(cell, placeholders).is_none()) {
            dropped_empty += 1;
            continue;
        }

        let short = if positional { raw.len() < width } else { raw.len() < needed };
        let overflow = positional
            && raw
                .iter()
                .skip(width)
                .any(|cell| clean_field(cell, placeholders).is_some());
        if short || overflow {
            return Err(PipelineError::schema(
                feed,
                &table.origin,
                format!("row {} has {} fields, header has {}", line, raw.len(), width),
            ));
        }

        if let Some(col) = padding
            .iter()
            .find(|i| raw.get(**i).and_then(|c| clean_field(c, placeholders)).is_some())
        {
            return Err(PipelineError::schema(
                feed,
                &table.origin,
                format!("row {} carries data in unmapped column {}", line, col),
            ));
        }

        let fields = selected
            .iter()
            .map(|(i, _)| raw.get(*i).and_then(|c| clean_field(c, placeholders)))
            .collect();
        rows.push(ReconciledRow { line, fields });
    }

    debug!(
        "{} [{}]: {} rows reconciled, {} empty rows dropped",
        feed,
        table.origin,
        rows.len(),
        dropped_empty
    );

    Ok(ReconciledTable {
        roles: selected.into_iter().map(|(_, r)| r).collect(),
        rows,
        dropped_empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::cleaner::DEFAULT_PLACEHOLDERS;

    fn placeholders() -> Vec<String> {
        DEFAULT_PLACEHOLDERS.iter().map(|s| s.to_string()).collect()
    }

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn balance_mapping() -> ColumnMapping {
        ColumnMapping::positional([
            ColumnRole::Date,
            ColumnRole::Clock,
            ColumnRole::Demand,
            ColumnRole::series("Nuclear"),
            ColumnRole::series("Solar"),
        ])
    }

    #[test]
    fn test_drops_empty_rows_and_placeholders() {
        let table = RawTable::new(
            "p1",
            strings(&["Date", "Time", "Demand", "Nuclear", "Solar"]),
            vec![
                strings(&["", "", "", "", ""]),
                strings(&["2022/04/01", "01:00", "100", "|", "－"]),
            ],
        );
        let out = reconcile(&table, &balance_mapping(), &placeholders(), "Test").unwrap();
        assert_eq!(out.dropped_empty, 1);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].line, 1);
        assert_eq!(
            out.rows[0].fields,
            vec![Some("2022/04/01".into()), Some("01:00".into()), Some("100".into()), None, None]
        );
    }

    #[test]
    fn test_column_count_mismatch_is_an_error() {
        let table = RawTable::new(
            "2019",
            strings(&["Date", "Time", "Demand", "Nuclear"]),
            vec![strings(&["2022/04/01", "01:00", "100", "20"])],
        );
        let err = reconcile(&table, &balance_mapping(), &placeholders(), "Test").unwrap_err();
        match err {
            PipelineError::SchemaMismatch { feed, origin, .. } => {
                assert_eq!(feed, "Test");
                assert_eq!(origin, "2019");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_short_row_is_an_error() {
        let table = RawTable::new(
            "p",
            strings(&["Date", "Time", "Demand", "Nuclear", "Solar"]),
            vec![strings(&["2022/04/01", "01:00", "100", "20"])],
        );
        assert!(matches!(
            reconcile(&table, &balance_mapping(), &placeholders(), "Test"),
            Err(PipelineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_excluded_header_is_dropped_before_mapping() {
        let table = RawTable::new(
            "q1",
            strings(&["月日", "時刻", "エリア需要", "原子力", "供給力合計", "太陽光"]),
            vec![strings(&["2022/07/01", "9時", "300", "10", "999", "5"])],
        );
        let mapping = balance_mapping().excluding("供給力合計");
        let out = reconcile(&table, &mapping, &placeholders(), "Hokkaido").unwrap();
        assert_eq!(out.rows[0].fields[3], Some("10".into()));
        assert_eq!(out.rows[0].fields[4], Some("5".into()));
    }

    #[test]
    fn test_blank_padding_must_stay_blank() {
        let header = strings(&["Date", "Time", "Demand", "Nuclear", "Solar", "", ""]);
        let ok = RawTable::new(
            "2020",
            header.clone(),
            vec![strings(&["2022/04/01", "01:00", "1", "2", "3", "", ""])],
        );
        let mapping = balance_mapping().allow_blank_padding();
        assert!(reconcile(&ok, &mapping, &placeholders(), "Kansai").is_ok());

        let bad = RawTable::new(
            "2021",
            header,
            vec![strings(&["2022/04/01", "01:00", "1", "2", "3", "", "7"])],
        );
        assert!(matches!(
            reconcile(&bad, &mapping, &placeholders(), "Kansai"),
            Err(PipelineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_by_header_selects_named_columns() {
        let mapping = ColumnMapping::by_header([
            ("年月日", ColumnRole::Date),
            ("時刻コード", ColumnRole::Slot),
            ("システムプライス(円/kWh)", ColumnRole::series("System")),
        ]);
        let table = RawTable::new(
            "spot_2022",
            strings(&["年月日", "時刻コード", "売り入札量(kWh)", "システムプライス(円/kWh)"]),
            vec![strings(&["2022/04/01", "1", "123", "12.5"])],
        );
        let out = reconcile(&table, &mapping, &placeholders(), "JEPX").unwrap();
        assert_eq!(out.roles.len(), 3);
        assert_eq!(out.rows[0].fields[2], Some("12.5".into()));

        let missing = RawTable::new("spot_2023", strings(&["年月日", "時刻コード"]), vec![]);
        assert!(matches!(
            reconcile(&missing, &mapping, &placeholders(), "JEPX"),
            Err(PipelineError::SchemaMismatch { .. })
        ));
    }
}
