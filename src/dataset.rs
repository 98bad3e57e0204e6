use std::collections::HashMap;
use std::path::Path;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::TellusError;
use crate::netcdf::{AttrValue, NcReader};

pub const TIME_CANDIDATES: [&str; 3] = ["time", "valid_time", "forecast_reference_time"];
pub const LAT_CANDIDATES: [&str; 2] = ["latitude", "lat"];
pub const LON_CANDIDATES: [&str; 2] = ["longitude", "lon"];

#[derive(Debug, Clone, PartialEq)]
pub struct TimeCoverage {
    pub coordinate: String,
    pub count: usize,
    pub first: NaiveDateTime,
    pub last: NaiveDateTime,
}

/// What the Validation Engine and the merge compatibility check need to know
/// about a stored file, independent of how it was read.
#[derive(Debug, Clone, Default)]
pub struct DatasetSummary {
    pub variables: Vec<String>,
    pub valid_counts: HashMap<String, (usize, usize)>,
    pub time: Option<TimeCoverage>,
    pub latitude: Option<(f64, f64)>,
    pub longitude: Option<(f64, f64)>,
    pub grid: Option<(usize, usize)>,
}

impl DatasetSummary {
    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.iter().any(|var| var == name)
    }
}

pub trait DatasetReader: Send + Sync {
    /// Summarize the file at `path`, scanning only the named variables for
    /// valid-data counts.
    fn summarize(&self, path: &Path, scan: &[String]) -> Result<DatasetSummary, TellusError>;
}

/// Production reader over the classic-format codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfDatasetReader;

impl DatasetReader for NetcdfDatasetReader {
    fn summarize(&self, path: &Path, scan: &[String]) -> Result<DatasetSummary, TellusError> {
        let mut nc = NcReader::open(path)?;
        let variables: Vec<String> = nc.variables.iter().map(|var| var.name.clone()).collect();

        let mut valid_counts = HashMap::new();
        for name in scan {
            if valid_counts.contains_key(name) {
                continue;
            }
            if let Some(idx) = nc.find(name) {
                valid_counts.insert(name.clone(), nc.valid_count(idx)?);
            }
        }

        let time = TIME_CANDIDATES
            .iter()
            .find_map(|candidate| nc.find(candidate).map(|idx| (candidate.to_string(), idx)))
            .and_then(|(coordinate, idx)| {
                let units = nc.variables[idx]
                    .attr("units")
                    .and_then(AttrValue::as_text)
                    .map(str::to_string)?;
                let values = nc.read_values(idx).ok()?;
                decode_time_axis(&coordinate, &units, &values)
            });

        let latitude = coordinate_bounds(&mut nc, &LAT_CANDIDATES);
        let longitude = coordinate_bounds(&mut nc, &LON_CANDIDATES);
        let grid = match (
            coordinate_len(&nc, &LAT_CANDIDATES),
            coordinate_len(&nc, &LON_CANDIDATES),
        ) {
            (Some(lat_len), Some(lon_len)) => Some((lat_len, lon_len)),
            _ => None,
        };

        Ok(DatasetSummary {
            variables,
            valid_counts,
            time,
            latitude,
            longitude,
            grid,
        })
    }
}

fn coordinate_bounds(nc: &mut NcReader, candidates: &[&str]) -> Option<(f64, f64)> {
    let idx = candidates.iter().find_map(|candidate| nc.find(candidate))?;
    let values = nc.read_values(idx).ok()?;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in &values {
        min = min.min(*value);
        max = max.max(*value);
    }
    if min.is_finite() && max.is_finite() {
        Some((min, max))
    } else {
        None
    }
}

fn coordinate_len(nc: &NcReader, candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|candidate| nc.find(candidate))
        .map(|idx| nc.element_count(idx))
}

fn decode_time_axis(coordinate: &str, units: &str, values: &[f64]) -> Option<TimeCoverage> {
    let (seconds_per_unit, epoch) = parse_time_units(units)?;
    let first = *values.first()?;
    let last = *values.last()?;
    Some(TimeCoverage {
        coordinate: coordinate.to_string(),
        count: values.len(),
        first: offset_from_epoch(epoch, first, seconds_per_unit)?,
        last: offset_from_epoch(epoch, last, seconds_per_unit)?,
    })
}

fn offset_from_epoch(epoch: NaiveDateTime, value: f64, seconds_per_unit: f64) -> Option<NaiveDateTime> {
    let millis = (value * seconds_per_unit * 1000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    epoch.checked_add_signed(Duration::milliseconds(millis as i64))
}

/// CF calendar attribute: `<unit>s since <date>[ <time>]`.
pub fn parse_time_units(units: &str) -> Option<(f64, NaiveDateTime)> {
    let re = Regex::new(
        r"(?i)^\s*(second|sec|minute|min|hour|hr|day|week)s?\s+since\s+(\d{1,4})-(\d{1,2})-(\d{1,2})(?:[ tT](\d{1,2}):(\d{1,2})(?::(\d{1,2}(?:\.\d+)?))?)?",
    )
    .unwrap();
    let caps = re.captures(units)?;

    let seconds_per_unit = match caps.get(1)?.as_str().to_ascii_lowercase().as_str() {
        "second" | "sec" => 1.0,
        "minute" | "min" => 60.0,
        "hour" | "hr" => 3600.0,
        "day" => 86_400.0,
        "week" => 604_800.0,
        _ => return None,
    };

    let year: i32 = caps.get(2)?.as_str().parse().ok()?;
    let month: u32 = caps.get(3)?.as_str().parse().ok()?;
    let day: u32 = caps.get(4)?.as_str().parse().ok()?;
    let hour: u32 = caps.get(5).map_or(Some(0), |m| m.as_str().parse().ok())?;
    let minute: u32 = caps.get(6).map_or(Some(0), |m| m.as_str().parse().ok())?;
    let second: f64 = caps.get(7).map_or(Some(0.0), |m| m.as_str().parse().ok())?;

    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let epoch = date.and_hms_opt(hour, minute, 0)?;
    let epoch = epoch.checked_add_signed(Duration::milliseconds((second * 1000.0) as i64))?;
    Some((seconds_per_unit, epoch))
}
