//! Payload decoding: raw bytes from a fetcher into a [`RawTable`].
//!
//! Utilities publish CSV in Shift_JIS or UTF-8 with preamble lines above the
//! header, and a few publish Excel workbooks. A [`PayloadLayout`] says where
//! the header is and how many lines to ignore at either end.

use crate::error::{PipelineError, PipelineResult};
use crate::models::RawTable;
use crate::normalizer::combine::trim_blank_trailing_columns;
use calamine::{Data, Range, Reader, open_workbook_auto_from_rs};
use chrono::{Duration, NaiveDate};
use encoding_rs::Encoding;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use encoding_rs::{SHIFT_JIS, UTF_8};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLocator {
    /// Zero-based line index of the header.
    Row(usize),
    /// First line whose first cell equals the marker, e.g. `DATE`.
    FirstCell(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Csv(&'static Encoding),
    /// First worksheet of an `.xls`/`.xlsx` workbook.
    Excel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadLayout {
    pub format: PayloadFormat,
    pub header: HeaderLocator,
    pub skip_footer: usize,
    /// Keep only the last n data rows.
    pub tail: Option<usize>,
}

impl PayloadLayout {
    pub fn csv(encoding: &'static Encoding) -> Self {
        Self {
            format: PayloadFormat::Csv(encoding),
            header: HeaderLocator::Row(0),
            skip_footer: 0,
            tail: None,
        }
    }

    pub fn excel() -> Self {
        Self {
            format: PayloadFormat::Excel,
            ..Self::csv(UTF_8)
        }
    }

    pub fn header_row(mut self, row: usize) -> Self {
        self.header = HeaderLocator::Row(row);
        self
    }

    pub fn header_marker(mut self, marker: &str) -> Self {
        self.header = HeaderLocator::FirstCell(marker.to_string());
        self
    }

    pub fn skip_footer(mut self, n: usize) -> Self {
        self.skip_footer = n;
        self
    }

    pub fn tail(mut self, n: usize) -> Self {
        self.tail = Some(n);
        self
    }

    /// Decode one payload into a table labelled `origin`.
    pub fn decode(&self, bytes: &[u8], origin: &str) -> PipelineResult<RawTable> {
        let cells = match self.format {
            PayloadFormat::Csv(encoding) => csv_cells(&decode_text(bytes, encoding, origin))?,
            PayloadFormat::Excel => excel_cells(bytes, origin)?,
        };
        self.frame(cells, origin)
    }

    fn frame(&self, mut cells: Vec<Vec<String>>, origin: &str) -> PipelineResult<RawTable> {
        let header_at = match &self.header {
            HeaderLocator::Row(n) => *n,
            HeaderLocator::FirstCell(marker) => cells
                .iter()
                .position(|r| r.first().is_some_and(|c| c.trim().trim_start_matches('\u{feff}') == marker))
                .ok_or_else(|| PipelineError::payload(origin, format!("no header line starting with {:?}", marker)))?,
        };
        if header_at >= cells.len() {
            return Err(PipelineError::payload(
                origin,
                format!("header line {} beyond end of payload ({} lines)", header_at, cells.len()),
            ));
        }

        let end = cells.len().saturating_sub(self.skip_footer).max(header_at + 1);
        cells.truncate(end);
        let mut rows = cells.split_off(header_at + 1);
        let header = cells.pop().unwrap_or_default();

        if let Some(n) = self.tail {
            let start = rows.len().saturating_sub(n);
            rows.drain(..start);
        }
        debug!("{}: header at line {}, {} data rows", origin, header_at, rows.len());
        // Blank trailing columns only; a filled extra column must reach reconcile.
        let mut table = RawTable::new(origin, header, rows);
        trim_blank_trailing_columns(&mut table);
        Ok(table)
    }
}

/// Decode text, honouring a byte-order mark over the configured encoding.
pub fn decode_text(bytes: &[u8], encoding: &'static Encoding, origin: &str) -> String {
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!("{}: malformed {} sequences replaced", origin, used.name());
    }
    text.into_owned()
}

fn csv_cells(text: &str) -> PipelineResult<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut cells = Vec::new();
    for record in reader.records() {
        let record = record?;
        cells.push(record.iter().map(str::to_string).collect());
    }
    Ok(cells)
}

fn excel_cells(bytes: &[u8], origin: &str) -> PipelineResult<Vec<Vec<String>>> {
    let excel_err = |message: String| PipelineError::Excel {
        origin: origin.to_string(),
        message,
    };
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| excel_err(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| excel_err("workbook has no sheets".into()))?
        .map_err(|e| excel_err(e.to_string()))?;

    Ok(range_cells(&range))
}

/// Cells of a worksheet range indexed from A1. calamine ranges start at the
/// first used cell, so leading blank rows and columns are put back.
fn range_cells(range: &Range<Data>) -> Vec<Vec<String>> {
    let Some((first_row, first_col)) = range.start() else {
        return Vec::new();
    };
    let lead = vec![String::new(); first_col as usize];

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); first_row as usize];
    cells.extend(range.rows().map(|row| {
        lead.iter()
            .cloned()
            .chain(row.iter().map(cell_text))
            .collect()
    }));
    cells
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => serial_to_text(dt.as_f64()),
    }
}

/// Render an Excel serial date as `YYYY/MM/DD`, `HH:MM`, or both.
pub fn serial_to_text(serial: f64) -> String {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return serial.to_string();
    };
    let days = serial.trunc() as i64;
    let seconds = ((serial - serial.trunc()) * 86_400.0).round() as i64;
    let offset = Duration::try_days(days).zip(Duration::try_seconds(seconds));
    let Some(dt) = epoch
        .and_hms_opt(0, 0, 0)
        .zip(offset)
        .and_then(|(midnight, (d, s))| midnight.checked_add_signed(d + s))
    else {
        return serial.to_string();
    };

    match (days, seconds) {
        (0, _) => dt.format("%H:%M").to_string(),
        (_, 0) => dt.format("%Y/%m/%d").to_string(),
        _ => dt.format("%Y/%m/%d %H:%M").to_string(),
    }
}

/// Files in `dir` with the given extension, sorted by name. A missing
/// directory yields nothing.
pub fn discover_files(dir: &Path, extension: &str) -> PipelineResult<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
