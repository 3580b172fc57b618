//! The source registry: where every utility publishes its data, how the
//! payload is laid out, and the profile its table is normalized with.

use crate::error::{PipelineError, PipelineResult};
use crate::loader::{PayloadLayout, SHIFT_JIS};
use crate::normalizer::combine::{Granularity, PeriodScheme};
use crate::normalizer::melt::MissingSupply;
use crate::normalizer::schema::{ColumnMapping, ColumnRole};
use crate::normalizer::timestamp::TimeShape;
use crate::normalizer::units::UnitConversion;
use crate::normalizer::{Normalizer, TableKind};
use crate::scraper::LinkRule;

/// Fuel types in the order most utilities publish them.
const FUELS: [&str; 11] = [
    "Nuclear",
    "Thermal",
    "Hydraulic",
    "Geothermal",
    "Biomass",
    "Solar(Actual)",
    "Solar(Output_Control)",
    "Wind(Actual)",
    "Wind(Output_Control)",
    "Pumped_Hydro",
    "Interconnector",
];

const SLASH_DATE: &str = "%Y/%m/%d";
const DATE_TIME_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

pub const REALTIME_PAGE: &str = "http://denkiyoho.hepco.co.jp/area_forecast.html";

pub fn realtime_rule() -> LinkRule {
    LinkRule::new("a.ic_csv")
}

/// How the period files of a source are found.
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// One file per period at a `{year}`/`{quarter}` URL template.
    Templated {
        template: String,
        granularity: Granularity,
    },
    /// Links listed on an index page.
    Index { page: String, rule: LinkRule },
}

impl Discovery {
    fn templated(template: &str, granularity: Granularity) -> Self {
        Self::Templated {
            template: template.to_string(),
            granularity,
        }
    }

    fn index(page: &str, rule: LinkRule) -> Self {
        Self::Index {
            page: page.to_string(),
            rule,
        }
    }

    /// The periods a templated source is polled for.
    pub fn scheme(&self, first_year: i32, last_year: i32) -> Option<PeriodScheme> {
        match self {
            Self::Templated { granularity, .. } => Some(PeriodScheme {
                first_year,
                last_year,
                granularity: *granularity,
            }),
            Self::Index { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: &'static str,
    pub discovery: Discovery,
    pub layout: PayloadLayout,
    pub normalizer: Normalizer,
}

impl SourceSpec {
    pub fn kind(&self) -> TableKind {
        self.normalizer.profile().kind
    }

    pub fn demand_only(&self) -> bool {
        self.kind() == TableKind::Balance && !self.normalizer.has_supply()
    }

    pub fn output_files(&self) -> Vec<String> {
        match self.kind() {
            TableKind::Price => vec![format!("{}_Price_Data.csv", self.name)],
            TableKind::Balance if self.demand_only() => vec![format!("{}_Demand_Data.csv", self.name)],
            TableKind::Balance => vec![
                format!("{}_Demand_Data.csv", self.name),
                format!("{}_Supply_Data.csv", self.name),
            ],
        }
    }
}

fn balance_roles(time: &[ColumnRole], fuels: &[&str]) -> Vec<ColumnRole> {
    time.iter()
        .cloned()
        .chain(std::iter::once(ColumnRole::Demand))
        .chain(fuels.iter().map(|f| ColumnRole::series(*f)))
        .collect()
}

fn date_clock_roles() -> Vec<ColumnRole> {
    balance_roles(&[ColumnRole::Date, ColumnRole::Clock], &FUELS)
}

fn combined_roles() -> Vec<ColumnRole> {
    balance_roles(&[ColumnRole::DateTime], &FUELS)
}

fn mwh(factor: f64) -> UnitConversion {
    UnitConversion::new(factor, "MWh")
}

// ── Balance sources ───────────────────────────────────────────────────────────

fn chubu() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Chubu",
        discovery: Discovery::templated(
            "https://powergrid.chuden.co.jp/denki_yoho_content_data/{year}_areabalance_current_term.csv",
            Granularity::Year,
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(4),
        normalizer: Normalizer::builder("Chubu")
            .mapping(ColumnMapping::positional(date_clock_roles()))
            .time(TimeShape::date_clock(SLASH_DATE))
            .units(mwh(1.0))
            .build()?,
    })
}

fn hokkaido() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Hokkaido",
        discovery: Discovery::templated(
            "https://www.hepco.co.jp/network/renewable_energy/fixedprice_purchase/csv/sup_dem_results_{year}_{quarter}q.csv",
            Granularity::Quarter,
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(2),
        normalizer: Normalizer::builder("Hokkaido")
            .mapping(ColumnMapping::positional(date_clock_roles()).excluding("供給力合計"))
            .time(TimeShape::hour_label(SLASH_DATE))
            .fill_dates()
            .units(mwh(1.0))
            .build()?,
    })
}

fn kansai() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Kansai",
        discovery: Discovery::templated(
            "https://www.kansai-td.co.jp/denkiyoho/csv/area_jyukyu_jisseki_{year}.csv",
            Granularity::Year,
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(1),
        normalizer: Normalizer::builder("Kansai")
            .mapping(ColumnMapping::positional(combined_roles()).allow_blank_padding())
            .time(TimeShape::combined(DATE_TIME_FORMATS))
            .units(mwh(1.0))
            .missing_supply(MissingSupply::Drop)
            .build()?,
    })
}

fn hokuriku() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Hokuriku",
        discovery: Discovery::index(
            "https://www.rikuden.co.jp/nw_jyukyudata/area_jisseki.html",
            LinkRule::new("li.MarkNewwin a"),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_marker("DATE"),
        normalizer: Normalizer::builder("Hokuriku")
            .mapping(ColumnMapping::positional(date_clock_roles()))
            .time(TimeShape::date_clock(SLASH_DATE))
            .units(mwh(10.0))
            .build()?,
    })
}

fn chugoku() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Chugoku",
        discovery: Discovery::index(
            "https://www.energia.co.jp/nw/service/retailer/data/area/",
            LinkRule::new("a.link-button-1"),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(2),
        normalizer: Normalizer::builder("Chugoku")
            .mapping(ColumnMapping::positional(date_clock_roles()))
            .time(TimeShape::date_clock(SLASH_DATE))
            .units(mwh(10.0))
            .build()?,
    })
}

fn tokyo() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Tokyo",
        discovery: Discovery::index(
            "https://www.tepco.co.jp/en/forecast/html/download-e.html",
            LinkRule::new("li.btn a"),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(1),
        normalizer: Normalizer::builder("Tokyo")
            .mapping(ColumnMapping::positional([
                ColumnRole::Date,
                ColumnRole::Clock,
                ColumnRole::Demand,
            ]))
            .time(TimeShape::date_clock(SLASH_DATE))
            .units(UnitConversion::new(10.0, "MW"))
            .build()?,
    })
}

fn tohoku() -> PipelineResult<SourceSpec> {
    let fuels = [
        "Hydraulic",
        "Thermal",
        "Nuclear",
        "Solar(Actual)",
        "Solar(Output_Control)",
        "Wind(Actual)",
        "Wind(Output_Control)",
        "Geothermal",
        "Biomass",
        "Pumped_Hydro",
        "Interconnector",
    ];
    Ok(SourceSpec {
        name: "Tohoku",
        discovery: Discovery::index(
            "https://setsuden.nw.tohoku-epco.co.jp/download.html",
            LinkRule::new("a").within("div.download.clearFix", 1),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS),
        normalizer: Normalizer::builder("Tohoku")
            .mapping(ColumnMapping::positional(balance_roles(&[ColumnRole::DateTime], &fuels)))
            .time(TimeShape::combined(DATE_TIME_FORMATS))
            .units(mwh(10.0))
            .build()?,
    })
}

fn shikoku() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Shikoku",
        discovery: Discovery::index(
            "https://www.yonden.co.jp/nw/renewable_energy/data/supply_demand.html",
            LinkRule::new("p.c-text_01 a").skip(1),
        ),
        layout: PayloadLayout::excel().header_row(8).skip_footer(1),
        normalizer: Normalizer::builder("Shikoku")
            .mapping(ColumnMapping::positional(date_clock_roles()))
            .time(TimeShape::date_clock(SLASH_DATE))
            .units(mwh(10.0))
            .build()?,
    })
}

fn kyushu() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "Kyushu",
        discovery: Discovery::index(
            "https://www.kyuden.co.jp/td_service_wheeling_rule-document_disclosure",
            LinkRule::new("td.n_align_center a.n_icon_excel"),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS).header_row(1),
        normalizer: Normalizer::builder("Kyushu")
            .mapping(ColumnMapping::positional(combined_roles()))
            .time(TimeShape::combined(DATE_TIME_FORMATS))
            .units(mwh(1.0))
            .build()?,
    })
}

// ── JEPX spot prices ──────────────────────────────────────────────────────────

const JEPX_AREAS: [(&str, &str); 9] = [
    ("北海道", "Hokkaido"),
    ("東北", "Tohoku"),
    ("東京", "Tokyo"),
    ("中部", "Chubu"),
    ("北陸", "Hokuriku"),
    ("関西", "Kansai"),
    ("中国", "Chugoku"),
    ("四国", "Shikoku"),
    ("九州", "Kyushu"),
];

/// Half-hour slots per day.
pub const JEPX_SLOTS: usize = 48;

fn jepx_normalizer(feed: &str) -> PipelineResult<Normalizer> {
    let mut columns = vec![
        ("年月日".to_string(), ColumnRole::Date),
        ("時刻コード".to_string(), ColumnRole::Slot),
        ("システムプライス(円/kWh)".to_string(), ColumnRole::series("System")),
    ];
    columns.extend(
        JEPX_AREAS
            .iter()
            .map(|(jp, en)| (format!("エリアプライス{}(円/kWh)", jp), ColumnRole::series(*en))),
    );
    Normalizer::builder(feed)
        .region("Japan")
        .prices()
        .mapping(ColumnMapping::by_header(columns))
        .time(TimeShape::half_hour_slots(SLASH_DATE))
        .units(UnitConversion::new(1.0, "JPY/kWh"))
        .build()
}

/// The yearly spot archives linked from the market index page.
pub fn jepx_archive() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "JEPX",
        discovery: Discovery::index(
            "http://www.jepx.org/english/market/index.html",
            LinkRule::new("a.arw").href_containing("spot"),
        ),
        layout: PayloadLayout::csv(SHIFT_JIS),
        normalizer: jepx_normalizer("JEPX")?,
    })
}

/// The last day of the current year's spot file.
pub fn jepx_daily() -> PipelineResult<SourceSpec> {
    Ok(SourceSpec {
        name: "JEPX_Daily",
        discovery: Discovery::templated("http://www.jepx.org/market/excel/spot_{year}.csv", Granularity::Year),
        layout: PayloadLayout::csv(SHIFT_JIS).tail(JEPX_SLOTS),
        normalizer: jepx_normalizer("JEPX_Daily")?,
    })
}

// ── Lookup ────────────────────────────────────────────────────────────────────

/// Every source a plain `run` covers, in a stable order.
pub fn registry() -> PipelineResult<Vec<SourceSpec>> {
    Ok(vec![
        chubu()?,
        chugoku()?,
        hokkaido()?,
        hokuriku()?,
        kansai()?,
        kyushu()?,
        shikoku()?,
        tohoku()?,
        tokyo()?,
        jepx_archive()?,
    ])
}

pub fn names() -> Vec<&'static str> {
    vec![
        "Chubu", "Chugoku", "Hokkaido", "Hokuriku", "Kansai", "Kyushu", "Shikoku", "Tohoku", "Tokyo", "JEPX",
    ]
}

/// Case-insensitive lookup by name.
pub fn find(name: &str) -> PipelineResult<SourceSpec> {
    registry()?
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| PipelineError::Config {
            feed: name.to_string(),
            message: format!("unknown source; known sources: {}", names().join(", ")),
        })
}
