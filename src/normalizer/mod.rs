//! The tabular normalizer: one pipeline, parameterized per source.
//!
//! ```text
//! RawTable ─▶ reconcile ─▶ fuse timestamps ─▶ convert units ─▶ dedup ─▶ split / melt ─▶ sort
//! ```
//!
//! A [`Normalizer`] is built from a [`SourceProfile`] through
//! [`NormalizerBuilder`], which validates the column mapping up front so a
//! misconfigured source fails before any data is fetched.

pub mod combine;
pub mod melt;
pub mod schema;
pub mod timestamp;
pub mod units;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{CanonicalTables, PriceRecord, RawTable, Timestamp};
use crate::scraper::cleaner::{DEFAULT_PLACEHOLDERS, parse_quantity};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use self::melt::{MissingSupply, WideRow, WideTable};
use self::schema::{ColumnMapping, ColumnRole, reconcile};
use self::timestamp::{TimeShape, TimestampFuser};
use self::units::UnitConversion;

/// What a source's table describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Area demand plus supply by fuel type.
    Balance,
    /// Prices per area, no demand column.
    Price,
}

#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub feed: String,
    pub region: String,
    pub kind: TableKind,
    pub mapping: ColumnMapping,
    pub time: TimeShape,
    pub fill_dates: bool,
    pub units: UnitConversion,
    pub missing_supply: MissingSupply,
    pub placeholders: Vec<String>,
}

pub struct NormalizerBuilder {
    feed: String,
    region: Option<String>,
    kind: TableKind,
    mapping: Option<ColumnMapping>,
    time: Option<TimeShape>,
    fill_dates: bool,
    units: UnitConversion,
    missing_supply: MissingSupply,
    placeholders: Vec<String>,
}

impl NormalizerBuilder {
    fn new(feed: &str) -> Self {
        Self {
            feed: feed.to_string(),
            region: None,
            kind: TableKind::Balance,
            mapping: None,
            time: None,
            fill_dates: false,
            units: UnitConversion::new(1.0, "MWh"),
            missing_supply: MissingSupply::Retain,
            placeholders: DEFAULT_PLACEHOLDERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn prices(mut self) -> Self {
        self.kind = TableKind::Price;
        self
    }

    pub fn mapping(mut self, mapping: ColumnMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn time(mut self, shape: TimeShape) -> Self {
        self.time = Some(shape);
        self
    }

    /// Carry the last seen date into rows whose date cell is blank.
    pub fn fill_dates(mut self) -> Self {
        self.fill_dates = true;
        self
    }

    pub fn units(mut self, units: UnitConversion) -> Self {
        self.units = units;
        self
    }

    pub fn missing_supply(mut self, policy: MissingSupply) -> Self {
        self.missing_supply = policy;
        self
    }

    pub fn build(self) -> PipelineResult<Normalizer> {
        let feed = self.feed;
        let fail = |message: String| PipelineError::Config {
            feed: feed.clone(),
            message,
        };

        let mapping = self.mapping.ok_or_else(|| fail("no column mapping".into()))?;
        let time = self.time.ok_or_else(|| fail("no time shape".into()))?;
        let region = self.region.unwrap_or_else(|| feed.clone());

        for role in time.required_roles() {
            if mapping.count(&role) != 1 {
                return Err(fail(format!("time shape needs exactly one {:?} column", role)));
            }
        }
        for role in mapping.roles().into_iter().filter(|r| r.is_time_component()) {
            if !time.required_roles().contains(role) {
                return Err(fail(format!("{:?} column is not read by {:?}", role, time)));
            }
        }
        if self.fill_dates && !time.required_roles().contains(&ColumnRole::Date) {
            return Err(fail("date filling needs a separate date column".into()));
        }

        let demand_columns = mapping.count(&ColumnRole::Demand);
        let labels = mapping.series_labels();
        match self.kind {
            TableKind::Balance if demand_columns != 1 => {
                return Err(fail(format!("expected one demand column, found {}", demand_columns)));
            }
            TableKind::Price if demand_columns != 0 || labels.is_empty() => {
                return Err(fail("price tables need series columns and no demand".into()));
            }
            _ => {}
        }
        let mut seen = HashSet::new();
        if let Some(dup) = labels.iter().find(|l| !seen.insert(l.as_str())) {
            return Err(fail(format!("series label {:?} used twice", dup)));
        }
        if !self.units.is_valid() {
            return Err(fail(format!("invalid unit conversion {:?}", self.units)));
        }

        Ok(Normalizer {
            profile: SourceProfile {
                feed,
                region,
                kind: self.kind,
                mapping,
                time,
                fill_dates: self.fill_dates,
                units: self.units,
                missing_supply: self.missing_supply,
                placeholders: self.placeholders,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    profile: SourceProfile,
}

impl Normalizer {
    pub fn builder(feed: &str) -> NormalizerBuilder {
        NormalizerBuilder::new(feed)
    }

    pub fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    pub fn feed(&self) -> &str {
        &self.profile.feed
    }

    pub fn has_supply(&self) -> bool {
        !self.profile.mapping.series_labels().is_empty()
    }

    /// Reconcile, fuse, convert and deduplicate into one row per timestamp,
    /// newest first. Fails when no row has a usable timestamp.
    pub fn widen(&self, table: &RawTable) -> PipelineResult<WideTable> {
        let p = &self.profile;
        let reconciled = reconcile(table, &p.mapping, &p.placeholders, &p.feed)?;

        let fused = TimestampFuser::new(&p.time, p.fill_dates).fuse_table(&reconciled);
        for err in &fused.rejected {
            debug!("{}: dropped {}", p.feed, err);
        }
        if !fused.rejected.is_empty() {
            warn!(
                "{} [{}]: {} rows dropped with unparsable timestamps",
                p.feed,
                table.origin,
                fused.rejected.len()
            );
        }
        if fused.rows.is_empty() {
            return Err(PipelineError::NoUsableRows {
                feed: p.feed.clone(),
                dropped: fused.rejected.len(),
            });
        }

        let demand_pos = reconciled.position(&ColumnRole::Demand);
        let series_pos: Vec<usize> = reconciled
            .roles
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, ColumnRole::Series(_)))
            .map(|(i, _)| i)
            .collect();

        let mut non_numeric = 0usize;
        let mut value_at = |fields: &[Option<String>], i: usize| -> Option<f64> {
            let raw = fields[i].as_deref()?;
            let parsed = parse_quantity(raw);
            if parsed.is_none() {
                non_numeric += 1;
            }
            parsed
        };

        let mut by_time: BTreeMap<Timestamp, WideRow> = BTreeMap::new();
        let mut replaced = 0usize;
        for (date_time, row) in fused.rows {
            let demand = p.units.demand(demand_pos.and_then(|i| value_at(&row.fields, i)));
            let series = series_pos
                .iter()
                .map(|&i| p.units.series(value_at(&row.fields, i)))
                .collect();
            let wide = WideRow {
                date_time,
                demand,
                series,
            };
            if by_time.insert(date_time, wide).is_some() {
                replaced += 1;
            }
        }

        if non_numeric > 0 {
            warn!("{}: {} non-numeric values treated as missing", p.feed, non_numeric);
        }
        if replaced > 0 {
            info!("{}: {} duplicate timestamps superseded by later rows", p.feed, replaced);
        }

        Ok(WideTable {
            labels: reconciled
                .roles
                .iter()
                .filter_map(|r| match r {
                    ColumnRole::Series(label) => Some(label.clone()),
                    _ => None,
                })
                .collect(),
            rows: by_time.into_values().rev().collect(),
        })
    }

    /// Demand and supply tables for a balance source.
    pub fn normalize(&self, table: &RawTable) -> PipelineResult<CanonicalTables> {
        let p = &self.profile;
        if p.kind != TableKind::Balance {
            return Err(PipelineError::Config {
                feed: p.feed.clone(),
                message: "not a demand/supply source".into(),
            });
        }
        let wide = self.widen(table)?;
        let tables = melt::split(&wide, &p.region, &p.units.unit, p.missing_supply);
        info!(
            "{}: {} demand rows, {} supply rows",
            p.feed,
            tables.demand.len(),
            tables.supply.len()
        );
        Ok(tables)
    }

    /// Long-form price table for a price source.
    pub fn normalize_prices(&self, table: &RawTable) -> PipelineResult<Vec<PriceRecord>> {
        let p = &self.profile;
        if p.kind != TableKind::Price {
            return Err(PipelineError::Config {
                feed: p.feed.clone(),
                message: "not a price source".into(),
            });
        }
        let wide = self.widen(table)?;
        Ok(melt::melt_prices(&wide, &p.units.unit))
    }
}
