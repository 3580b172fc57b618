use super::LinkRule;
use crate::error::{FetchError, PipelineError, PipelineResult};
use crate::models::{GenerationRecord, RealtimeObservation, Timestamp};
use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

// ── Index pages ───────────────────────────────────────────────────────────────

fn selector(css: &str, page: &Url) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Page {
        url: page.to_string(),
        message: format!("selector {:?}: {:?}", css, e),
    })
}

/// Data-file links on an index page, resolved against the page URL.
pub fn extract_links(html: &str, page: &Url, rule: &LinkRule) -> Result<Vec<Url>, FetchError> {
    let doc = Html::parse_document(html);
    let link_sel = selector(&rule.selector, page)?;

    let hrefs: Vec<&str> = match &rule.container {
        Some((css, index)) => {
            let container_sel = selector(css, page)?;
            let Some(container) = doc.select(&container_sel).nth(*index) else {
                warn!("{}: no container #{} for {:?}", page, index, css);
                return Ok(Vec::new());
            };
            container
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .collect()
        }
        None => doc
            .select(&link_sel)
            .filter_map(|a| a.value().attr("href"))
            .collect(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for href in hrefs
        .into_iter()
        .map(str::trim)
        .filter(|h| rule.href_contains.as_deref().is_none_or(|n| h.contains(n)))
        .skip(rule.skip)
    {
        let url = page.join(href).map_err(|e| FetchError::Page {
            url: page.to_string(),
            message: format!("bad href {:?}: {}", href, e),
        })?;
        if seen.insert(url.clone()) {
            links.push(url);
        }
    }
    Ok(links)
}

// ── Hokkaido realtime CSV ─────────────────────────────────────────────────────

const REALTIME_REGION: &str = "Hokkaido";
const REALTIME_MARKER: &str = "DATE,TIME,";
/// Published in 10,000 kW.
const REALTIME_FACTOR: f64 = 10.0;

fn observation(date_time: Timestamp, data_type: &str, unit: &str, value: f64) -> RealtimeObservation {
    RealtimeObservation {
        date_time,
        region: REALTIME_REGION.to_string(),
        data_type: data_type.to_string(),
        unit: unit.to_string(),
        value,
    }
}

/// The last filled row of the table starting after `start`: rows are read in
/// order until the first one without a performance figure.
fn latest_filled_row<'a>(lines: &[&'a str], start: usize) -> Option<Vec<&'a str>> {
    let mut latest = None;
    for line in lines.iter().skip(start + 1) {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() < 4 || fields[2].is_empty() {
            break;
        }
        latest = Some(fields);
    }
    latest
}

fn realtime_values(fields: &[&str], origin: &str) -> PipelineResult<(Timestamp, Vec<f64>)> {
    let stamp = format!("{} {}", fields[0], fields[1]);
    let date_time = NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M")
        .map_err(|_| PipelineError::payload(origin, format!("bad realtime timestamp {:?}", stamp)))?;
    let values = fields[2..]
        .iter()
        .map(|v| {
            crate::scraper::cleaner::parse_quantity(v)
                .ok_or_else(|| PipelineError::payload(origin, format!("bad realtime value {:?}", v)))
        })
        .collect::<PipelineResult<Vec<f64>>>()?;
    Ok((date_time, values))
}

/// Latest hourly and 5-minute observations from the realtime area CSV.
pub fn parse_realtime(text: &str, origin: &str) -> PipelineResult<Vec<RealtimeObservation>> {
    let lines: Vec<&str> = text.lines().collect();
    let tables: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.contains(REALTIME_MARKER))
        .map(|(i, _)| i)
        .collect();
    if tables.len() < 2 {
        return Err(PipelineError::payload(
            origin,
            format!("expected hourly and 5-minute tables, found {}", tables.len()),
        ));
    }

    let mut out = Vec::with_capacity(6);

    match latest_filled_row(&lines, tables[0]) {
        Some(fields) if fields.len() >= 6 => {
            let (ts, v) = realtime_values(&fields[..6], origin)?;
            out.push(observation(ts, "Hourly Performance", "MW", v[0] * REALTIME_FACTOR));
            out.push(observation(ts, "Estimated Hourly Performance", "MW", v[1] * REALTIME_FACTOR));
            out.push(observation(ts, "Hourly Usage Rate", "%", v[2]));
            out.push(observation(ts, "Estimated Hourly Supply", "MW", v[3] * REALTIME_FACTOR));
        }
        Some(fields) => {
            return Err(PipelineError::payload(
                origin,
                format!("hourly row has {} fields, expected 6", fields.len()),
            ));
        }
        None => warn!("{}: hourly table has no filled rows yet", origin),
    }

    match latest_filled_row(&lines, tables[1]) {
        Some(fields) => {
            let (ts, v) = realtime_values(&fields[..4], origin)?;
            out.push(observation(ts, "5-Minute Performance", "MW", v[0] * REALTIME_FACTOR));
            out.push(observation(ts, "5-Minute Solar Performance", "MW", v[1] * REALTIME_FACTOR));
        }
        None => warn!("{}: 5-minute table has no filled rows yet", origin),
    }

    debug!("{}: {} realtime observations", origin, out.len());
    Ok(out)
}

// ── Vietnam generation reports ────────────────────────────────────────────────

const PERIOD_PATTERN: &str = r"(\d{1,2})/(\d{4})";
const FIGURE_PATTERN: &str = r"\d+,\d+";

/// Million kWh to MWh.
const GENERATION_FACTOR: f64 = 1_000.0;

/// Month and national generation from the text of a monthly report. The
/// first `MM/YYYY` is the period, the first `d,ddd` figure (decimal comma)
/// the generation in million kWh.
pub fn parse_generation_report(text: &str, origin: &str) -> PipelineResult<GenerationRecord> {
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|e| PipelineError::payload(origin, e.to_string()))
    };
    let period = compile(PERIOD_PATTERN)?
        .captures(text)
        .ok_or_else(|| PipelineError::payload(origin, "no MM/YYYY period in report"))?;
    let month: u32 = period[1]
        .parse()
        .map_err(|_| PipelineError::payload(origin, "bad month"))?;
    let year: i32 = period[2]
        .parse()
        .map_err(|_| PipelineError::payload(origin, "bad year"))?;
    if !(1..=12).contains(&month) {
        return Err(PipelineError::payload(origin, format!("month {} out of range", month)));
    }

    let figure = compile(FIGURE_PATTERN)?
        .find(text)
        .ok_or_else(|| PipelineError::payload(origin, "no generation figure in report"))?;
    let generation: f64 = figure
        .as_str()
        .replace(',', ".")
        .parse()
        .map_err(|_| PipelineError::payload(origin, format!("bad figure {:?}", figure.as_str())))?;

    Ok(GenerationRecord {
        year,
        month,
        country: "Vietnam".to_string(),
        generation: generation * GENERATION_FACTOR,
        unit: "MWh".to_string(),
    })
}
