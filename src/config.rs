use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::app::RunOptions;
use crate::domain::{
    BoundingBox, DownloadTask, SplitGranularity, default_hours, parse_date, parse_hour,
};
use crate::error::TellusError;
use crate::mapping::VariableMapping;
use crate::split::build_tasks;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub variable_mapping: HashMap<String, String>,
    #[serde(default)]
    pub requests: Vec<RequestEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub retry_times: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RequestEntry {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub variables: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub area: Option<BoundingBox>,
    #[serde(default)]
    pub hours: Option<Vec<String>>,
    #[serde(default)]
    pub split_by: Option<SplitGranularity>,
    #[serde(default)]
    pub merge: bool,
    #[serde(default)]
    pub merged_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub name: String,
    pub variables: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub area: Option<BoundingBox>,
    pub hours: Vec<u8>,
    pub split_by: SplitGranularity,
    pub merge: bool,
    pub merged_name: Option<String>,
}

impl ResolvedRequest {
    pub fn tasks(&self) -> Result<Vec<DownloadTask>, TellusError> {
        build_tasks(
            &self.variables,
            self.start,
            self.end,
            self.area,
            &self.hours,
            self.split_by,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub output_dir: Option<Utf8PathBuf>,
    pub options: RunOptions,
    pub archive_url: Option<String>,
    pub api_token: Option<String>,
    pub mapping: VariableMapping,
    pub requests: Vec<ResolvedRequest>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, TellusError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("tellus-cm.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(TellusError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| TellusError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| TellusError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, TellusError> {
        let defaults = RunOptions::default();
        let options = RunOptions {
            max_workers: config.settings.max_workers.unwrap_or(defaults.max_workers),
            retry_times: config.settings.retry_times.unwrap_or(defaults.retry_times),
            retry_delay: config
                .settings
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
        };

        let requests = config
            .requests
            .into_iter()
            .filter(|entry| entry.enabled)
            .map(Self::resolve_request)
            .collect::<Result<Vec<_>, TellusError>>()?;

        Ok(ResolvedConfig {
            output_dir: config.settings.output_dir.map(Utf8PathBuf::from),
            options,
            archive_url: config.settings.archive_url,
            api_token: config.settings.api_token,
            mapping: VariableMapping::with_overrides(&config.variable_mapping),
            requests,
        })
    }

    fn resolve_request(entry: RequestEntry) -> Result<ResolvedRequest, TellusError> {
        if entry.variables.is_empty() {
            return Err(TellusError::ConfigParse(format!(
                "request {} lists no variables",
                entry.name
            )));
        }
        let hours = match entry.hours {
            Some(values) => values
                .iter()
                .map(|value| parse_hour(value))
                .collect::<Result<Vec<_>, TellusError>>()?,
            None => default_hours(),
        };
        Ok(ResolvedRequest {
            name: entry.name,
            variables: entry.variables,
            start: parse_date(&entry.start_date)?,
            end: parse_date(&entry.end_date)?,
            area: entry.area,
            hours,
            split_by: entry.split_by.unwrap_or(SplitGranularity::Month),
            merge: entry.merge,
            merged_name: entry.merged_name,
        })
    }
}

fn default_enabled() -> bool {
    true
}
