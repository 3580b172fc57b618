//! Demand/supply split and the wide → long unpivot.

use crate::models::{CanonicalTables, DemandRecord, PriceRecord, SupplyRecord, Timestamp};
use std::cmp::Ordering;

/// What to do with a fuel type that reported no figure for a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingSupply {
    /// Keep the observation with an empty value.
    #[default]
    Retain,
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub date_time: Timestamp,
    pub demand: Option<f64>,
    /// One value per entry of [`WideTable::labels`].
    pub series: Vec<Option<f64>>,
}

/// One row per timestamp, one column per series; converted and deduplicated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WideTable {
    pub labels: Vec<String>,
    pub rows: Vec<WideRow>,
}

impl WideTable {
    /// Long-form `(timestamp, label, value)` triples, one per row × series.
    pub fn unpivot(&self) -> impl Iterator<Item = (Timestamp, &str, Option<f64>)> + '_ {
        self.rows.iter().flat_map(move |row| {
            self.labels
                .iter()
                .zip(row.series.iter())
                .map(move |(label, value)| (row.date_time, label.as_str(), *value))
        })
    }
}

/// Newest first.
pub fn sort_demand(records: &mut [DemandRecord]) {
    records.sort_by(|a, b| b.date_time.cmp(&a.date_time));
}

/// Newest first, then fuel type descending.
pub fn sort_supply(records: &mut [SupplyRecord]) {
    records.sort_by(|a, b| long_order((a.date_time, &a.fuel_type), (b.date_time, &b.fuel_type)));
}

pub fn sort_prices(records: &mut [PriceRecord]) {
    records.sort_by(|a, b| long_order((a.date_time, &a.region), (b.date_time, &b.region)));
}

fn long_order(a: (Timestamp, &String), b: (Timestamp, &String)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| b.1.cmp(a.1))
}

/// Derive both canonical tables from a wide table.
pub fn split(wide: &WideTable, region: &str, unit: &str, missing: MissingSupply) -> CanonicalTables {
    let mut demand: Vec<DemandRecord> = wide
        .rows
        .iter()
        .filter_map(|row| {
            row.demand.map(|value| DemandRecord {
                date_time: row.date_time,
                region: region.to_string(),
                unit: unit.to_string(),
                area_demand: value,
            })
        })
        .collect();

    let mut supply: Vec<SupplyRecord> = wide
        .unpivot()
        .filter(|(_, _, value)| missing == MissingSupply::Retain || value.is_some())
        .map(|(date_time, label, value)| SupplyRecord {
            date_time,
            region: region.to_string(),
            unit: unit.to_string(),
            fuel_type: label.to_string(),
            supply: value,
        })
        .collect();

    sort_demand(&mut demand);
    sort_supply(&mut supply);
    CanonicalTables { demand, supply }
}

/// Long-form price table; the series label becomes the region.
pub fn melt_prices(wide: &WideTable, unit: &str) -> Vec<PriceRecord> {
    let mut prices: Vec<PriceRecord> = wide
        .unpivot()
        .map(|(date_time, label, value)| PriceRecord {
            date_time,
            region: label.to_string(),
            unit: unit.to_string(),
            price: value,
        })
        .collect();
    sort_prices(&mut prices);
    prices
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn at(day: u32, hour: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2022, 4, day).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn sample() -> WideTable {
        WideTable {
            labels: vec!["Nuclear".into(), "Solar".into(), "Wind".into()],
            rows: vec![
                WideRow { date_time: at(1, 1), demand: Some(10.0), series: vec![Some(1.0), None, Some(3.0)] },
                WideRow { date_time: at(2, 5), demand: None, series: vec![Some(4.0), Some(5.0), Some(6.0)] },
                WideRow { date_time: at(1, 3), demand: Some(30.0), series: vec![Some(7.0), Some(8.0), None] },
            ],
        }
    }

    #[test]
    fn test_melt_count_and_repivot() {
        let wide = sample();
        let tables = split(&wide, "Test", "MWh", MissingSupply::Retain);
        assert_eq!(tables.supply.len(), wide.rows.len() * wide.labels.len());

        let repivot: HashMap<(Timestamp, String), Option<f64>> = tables
            .supply
            .iter()
            .map(|r| ((r.date_time, r.fuel_type.clone()), r.supply))
            .collect();
        for row in &wide.rows {
            for (label, value) in wide.labels.iter().zip(&row.series) {
                assert_eq!(repivot[&(row.date_time, label.clone())], *value);
            }
        }
    }

    #[test]
    fn test_demand_drops_missing_and_sorts_newest_first() {
        let tables = split(&sample(), "Test", "MWh", MissingSupply::Retain);
        let times: Vec<_> = tables.demand.iter().map(|d| d.date_time).collect();
        assert_eq!(times, vec![at(1, 3), at(1, 1)]);
    }

    #[test]
    fn test_supply_ordering_invariant() {
        let tables = split(&sample(), "Test", "MWh", MissingSupply::Retain);
        for pair in tables.supply.windows(2) {
            assert!(pair[0].date_time >= pair[1].date_time);
            if pair[0].date_time == pair[1].date_time {
                assert!(pair[0].fuel_type > pair[1].fuel_type);
            }
        }
        assert_eq!(tables.supply[0].date_time, at(2, 5));
        assert_eq!(tables.supply[0].fuel_type, "Wind");
    }

    #[test]
    fn test_drop_policy_removes_missing_supply() {
        let tables = split(&sample(), "Test", "MWh", MissingSupply::Drop);
        assert_eq!(tables.supply.len(), 7);
        assert!(tables.supply.iter().all(|r| r.supply.is_some()));
    }

    #[test]
    fn test_melt_prices_uses_label_as_region() {
        let wide = WideTable {
            labels: vec!["System".into(), "Tokyo".into()],
            rows: vec![WideRow { date_time: at(1, 0), demand: None, series: vec![Some(12.0), Some(13.5)] }],
        };
        let prices = melt_prices(&wide, "JPY/kWh");
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].region, "Tokyo");
        assert_eq!(prices[1].price, Some(12.0));
    }
}
