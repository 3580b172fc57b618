use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Timestamp = NaiveDateTime;

const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn ser_date_time<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&ts.format(DATE_TIME_FORMAT))
}

fn de_date_time<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
    let raw = String::deserialize(d)?;
    NaiveDateTime::parse_from_str(raw.trim(), DATE_TIME_FORMAT).map_err(serde::de::Error::custom)
}

// ── Raw input ─────────────────────────────────────────────────────────────────

/// A table as delivered by a fetcher: untyped string fields under a
/// source-specific header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Period or file label, used in diagnostics.
    pub origin: String,
}

impl RawTable {
    pub fn new(origin: impl Into<String>, header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            header,
            rows,
            origin: origin.into(),
        }
    }

    pub fn width(&self) -> usize {
        self.header.len()
    }

}

// ── Canonical outputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemandRecord {
    #[serde(rename = "Date_Time", serialize_with = "ser_date_time", deserialize_with = "de_date_time")]
    pub date_time: Timestamp,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "Area_Demand")]
    pub area_demand: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupplyRecord {
    #[serde(rename = "Date_Time", serialize_with = "ser_date_time", deserialize_with = "de_date_time")]
    pub date_time: Timestamp,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "Fuel_Type")]
    pub fuel_type: String,
    /// Missing when the source reported no figure for this fuel type.
    #[serde(rename = "Supply")]
    pub supply: Option<f64>,
}

/// Both canonical tables of one source run, newest observation first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalTables {
    pub demand: Vec<DemandRecord>,
    pub supply: Vec<SupplyRecord>,
}

/// JEPX spot price for one area and half-hour slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRecord {
    #[serde(rename = "Date_Time", serialize_with = "ser_date_time", deserialize_with = "de_date_time")]
    pub date_time: Timestamp,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "Price")]
    pub price: Option<f64>,
}

/// One line of the append-only realtime log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeObservation {
    #[serde(rename = "Date_Time", serialize_with = "ser_date_time", deserialize_with = "de_date_time")]
    pub date_time: Timestamp,
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "Data_Type")]
    pub data_type: String,
    #[serde(rename = "Unit")]
    pub unit: String,
    #[serde(rename = "Value")]
    pub value: f64,
}

/// Monthly national generation figure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRecord {
    #[serde(rename = "Year")]
    pub year: i32,
    #[serde(rename = "Month")]
    pub month: u32,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Generation")]
    pub generation: f64,
    #[serde(rename = "Unit")]
    pub unit: String,
}

// ── Append-log keys ───────────────────────────────────────────────────────────

/// Identity of a row in an append-only log; re-appending an existing key is a no-op.
pub trait LogKey {
    fn log_key(&self) -> (Timestamp, String);
}

impl LogKey for RealtimeObservation {
    fn log_key(&self) -> (Timestamp, String) {
        (self.date_time, self.data_type.clone())
    }
}

impl LogKey for PriceRecord {
    fn log_key(&self) -> (Timestamp, String) {
        (self.date_time, self.region.clone())
    }
}
