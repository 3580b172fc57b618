//! Timestamp fusion: turn the date/time columns of a reconciled row into a
//! single chronologically comparable [`Timestamp`].

use super::schema::{ColumnRole, ReconciledRow, ReconciledTable};
use crate::error::TimestampParseError;
use crate::models::Timestamp;
use crate::scraper::cleaner::rewrite_hour_label;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// How a source encodes the time of an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeShape {
    /// Separate `Date` and `Clock` fields, clock as `HH:MM`.
    DateClock { date_format: String },
    /// Separate `Date` and `Clock` fields, clock as an hour label (`9時`).
    DateHourLabel { date_format: String },
    /// One `DateTime` field; the first matching format wins.
    Combined { formats: Vec<String> },
    /// `Date` plus a `Slot` code counting fixed intervals from midnight, starting at 1.
    DateSlot { date_format: String, slot_minutes: u32 },
}

impl TimeShape {
    pub fn date_clock(date_format: &str) -> Self {
        Self::DateClock {
            date_format: date_format.to_string(),
        }
    }

    pub fn hour_label(date_format: &str) -> Self {
        Self::DateHourLabel {
            date_format: date_format.to_string(),
        }
    }

    pub fn combined(formats: &[&str]) -> Self {
        Self::Combined {
            formats: formats.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn half_hour_slots(date_format: &str) -> Self {
        Self::DateSlot {
            date_format: date_format.to_string(),
            slot_minutes: 30,
        }
    }

    /// The column roles this shape reads, date part first.
    pub fn required_roles(&self) -> Vec<ColumnRole> {
        match self {
            Self::DateClock { .. } | Self::DateHourLabel { .. } => {
                vec![ColumnRole::Date, ColumnRole::Clock]
            }
            Self::Combined { .. } => vec![ColumnRole::DateTime],
            Self::DateSlot { .. } => vec![ColumnRole::Date, ColumnRole::Slot],
        }
    }

    /// Fuse the date part and (optional) time part of one row.
    pub fn fuse(&self, date: &str, time: Option<&str>) -> Option<Timestamp> {
        let date = date.trim();
        match self {
            Self::DateClock { date_format } => {
                let day = NaiveDate::parse_from_str(date, date_format).ok()?;
                let clock = time?.trim();
                let tod = NaiveTime::parse_from_str(clock, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(clock, "%H:%M:%S"))
                    .ok()?;
                Some(day.and_time(tod))
            }
            Self::DateHourLabel { date_format } => {
                let day = NaiveDate::parse_from_str(date, date_format).ok()?;
                let (hour, clock) = rewrite_hour_label(time?)?;
                if hour == 24 {
                    return day.succ_opt()?.and_hms_opt(0, 0, 0);
                }
                let tod = NaiveTime::parse_from_str(&clock, "%H:%M").ok()?;
                Some(day.and_time(tod))
            }
            Self::Combined { formats } => formats
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(date, f).ok()),
            Self::DateSlot {
                date_format,
                slot_minutes,
            } => {
                let day = NaiveDate::parse_from_str(date, date_format).ok()?;
                let slot: u32 = time?.trim().parse().ok()?;
                let per_day = 24 * 60 / slot_minutes;
                if slot == 0 || slot > per_day {
                    return None;
                }
                let start = day.and_hms_opt(0, 0, 0)?;
                Some(start + Duration::minutes(i64::from((slot - 1) * slot_minutes)))
            }
        }
    }
}

/// Rows that fused cleanly, plus the ones that did not.
#[derive(Debug)]
pub struct FusedRows<'a> {
    pub rows: Vec<(Timestamp, &'a ReconciledRow)>,
    pub rejected: Vec<TimestampParseError>,
}

pub struct TimestampFuser<'s> {
    shape: &'s TimeShape,
    fill_dates: bool,
}

impl<'s> TimestampFuser<'s> {
    pub fn new(shape: &'s TimeShape, fill_dates: bool) -> Self {
        Self { shape, fill_dates }
    }

    /// Fuse every row of the table. With date filling enabled a blank date
    /// inherits the last date seen above it; nothing else is ever filled.
    pub fn fuse_table<'a>(&self, table: &'a ReconciledTable) -> FusedRows<'a> {
        let roles = self.shape.required_roles();
        let date_pos = table.position(&roles[0]);
        let time_pos = roles.get(1).and_then(|r| table.position(r));

        let mut last_date: Option<&str> = None;
        let mut rows = Vec::with_capacity(table.rows.len());
        let mut rejected = Vec::new();

        for row in &table.rows {
            let own_date = date_pos.and_then(|i| row.fields[i].as_deref());
            let date = match own_date {
                Some(d) => {
                    last_date = Some(d);
                    Some(d)
                }
                None if self.fill_dates => last_date,
                None => None,
            };
            let time = time_pos.and_then(|i| row.fields[i].as_deref());

            match date.and_then(|d| self.shape.fuse(d, time)) {
                Some(ts) => rows.push((ts, row)),
                None => rejected.push(TimestampParseError {
                    row: row.line,
                    value: format!("{} {}", date.unwrap_or(""), time.unwrap_or("")).trim().to_string(),
                }),
            }
        }

        FusedRows { rows, rejected }
    }
}
