use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::TellusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SplitGranularity {
    Month,
    Year,
    None,
}

impl fmt::Display for SplitGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitGranularity::Month => write!(f, "month"),
            SplitGranularity::Year => write!(f, "year"),
            SplitGranularity::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::InProgress => write!(f, "in_progress"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn for_month(year: i32, month: u32) -> Self {
        Self(format!("{year:04}{month:02}"))
    }

    pub fn for_year(year: i32) -> Self {
        Self(format!("{year:04}"))
    }

    pub fn for_span(start: NaiveDate, end: NaiveDate) -> Self {
        Self(format!(
            "{}_{}",
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskKey {
    type Err = TellusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let all_digits = |s: &str| !s.is_empty() && s.chars().all(|ch| ch.is_ascii_digit());
        let valid = match trimmed.len() {
            4 => all_digits(trimmed),
            6 => {
                all_digits(trimmed)
                    && trimmed[4..]
                        .parse::<u32>()
                        .map(|month| (1..=12).contains(&month))
                        .unwrap_or(false)
            }
            17 => match trimmed.split_once('_') {
                Some((start, end)) => {
                    start.len() == 8 && end.len() == 8 && all_digits(start) && all_digits(end)
                }
                None => false,
            },
            _ => false,
        };
        if !valid {
            return Err(TellusError::InvalidKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn new(north: f64, west: f64, south: f64, east: f64) -> Result<Self, TellusError> {
        let lat_ok = (-90.0..=90.0).contains(&north) && (-90.0..=90.0).contains(&south);
        let lon_ok = (-180.0..=360.0).contains(&west) && (-180.0..=360.0).contains(&east);
        if !lat_ok || !lon_ok || north < south {
            return Err(TellusError::InvalidArea(format!(
                "[{north}, {west}, {south}, {east}]"
            )));
        }
        Ok(Self {
            north,
            west,
            south,
            east,
        })
    }

    pub fn lat_bounds(&self) -> (f64, f64) {
        (self.south, self.north)
    }

    pub fn lon_bounds(&self) -> (f64, f64) {
        if self.west <= self.east {
            (self.west, self.east)
        } else {
            (self.east, self.west)
        }
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = TellusError;

    fn try_from(value: [f64; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(value: BoundingBox) -> Self {
        [value.north, value.west, value.south, value.east]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub key: TaskKey,
    pub variables: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub months: Vec<u32>,
    pub days: Vec<u32>,
    pub hours: Vec<u8>,
    pub area: Option<BoundingBox>,
}

impl DownloadTask {
    pub fn year(&self) -> i32 {
        self.start.year()
    }

    pub fn single_month(&self) -> Option<u32> {
        match self.months.as_slice() {
            [month] => Some(*month),
            _ => None,
        }
    }

    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn expected_timesteps(&self) -> usize {
        self.span_days() as usize * self.hours.len()
    }

    pub fn output_filename(&self) -> String {
        format!("ERA5_Land_{}_{}.nc", self.variables.join("_"), self.key)
    }
}

pub fn default_hours() -> Vec<u8> {
    (0..24).collect()
}

pub fn parse_hour(value: &str) -> Result<u8, TellusError> {
    let trimmed = value.trim();
    let hour_part = match trimmed.split_once(':') {
        Some((hour, minutes)) => {
            if minutes != "00" {
                return Err(TellusError::InvalidHour(value.to_string()));
            }
            hour
        }
        None => trimmed,
    };
    let hour: u8 = hour_part
        .parse()
        .map_err(|_| TellusError::InvalidHour(value.to_string()))?;
    if hour > 23 {
        return Err(TellusError::InvalidHour(value.to_string()));
    }
    Ok(hour)
}

pub fn format_hour(hour: u8) -> String {
    format!("{hour:02}:00")
}

pub fn parse_date(value: &str) -> Result<NaiveDate, TellusError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| TellusError::InvalidDate(value.to_string()))
}
