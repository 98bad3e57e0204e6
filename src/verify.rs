use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Datelike;
use serde::Serialize;

use crate::dataset::DatasetReader;
use crate::domain::DownloadTask;
use crate::mapping::VariableMapping;
use crate::store::Store;

pub const SPATIAL_TOLERANCE_DEG: f64 = 0.5;
pub const TIMESTEP_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{label}")
    }
}

/// Append-only, timestamped check log. Write failures are reported through
/// tracing and never interrupt a verification pass.
#[derive(Debug, Clone)]
pub struct VerificationLog {
    path: Utf8PathBuf,
}

impl VerificationLog {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn session_start(&self) {
        self.append(LogLevel::Info, &"=".repeat(80));
        self.append(LogLevel::Info, "new verification session");
        self.append(LogLevel::Info, &"=".repeat(80));
    }

    pub fn append(&self, level: LogLevel, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{stamp}] [{level}] {message}");
        if let Err(err) = Store::append_line(&self.path, &line) {
            tracing::warn!("verification log write failed: {err}");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableCheck {
    pub name: String,
    pub stored_as: Option<String>,
    pub present: bool,
    pub valid_fraction: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub file: String,
    pub variables: Vec<VariableCheck>,
    pub detected_year: Option<i32>,
    pub detected_month: Option<u32>,
    pub detected_latitude: Option<(f64, f64)>,
    pub detected_longitude: Option<(f64, f64)>,
    pub timesteps: Option<usize>,
    pub warnings: Vec<String>,
    pub failures: Vec<String>,
    pub passed: bool,
}

/// Post-download correctness checks against the originating task. Openability
/// aborts the pass; every later check runs regardless of earlier outcomes.
pub struct Validator<'a> {
    reader: &'a dyn DatasetReader,
    mapping: &'a VariableMapping,
    log: &'a VerificationLog,
}

impl<'a> Validator<'a> {
    pub fn new(
        reader: &'a dyn DatasetReader,
        mapping: &'a VariableMapping,
        log: &'a VerificationLog,
    ) -> Self {
        Self {
            reader,
            mapping,
            log,
        }
    }

    pub fn verify(&self, path: &Utf8Path, task: &DownloadTask) -> ValidationReport {
        let mut warnings: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        self.log.append(LogLevel::Info, &"=".repeat(80));
        self.log.append(
            LogLevel::Info,
            &format!("verifying {}", path.file_name().unwrap_or(path.as_str())),
        );
        self.log.append(LogLevel::Info, &format!("path: {path}"));

        self.log.append(LogLevel::Info, "[1/5] openability");
        let scan: Vec<String> = task
            .variables
            .iter()
            .flat_map(|name| self.mapping.candidates(name))
            .map(str::to_string)
            .collect();
        let summary = match self.reader.summarize(path.as_std_path(), &scan) {
            Ok(summary) => {
                self.log.append(LogLevel::Success, "dataset opened");
                summary
            }
            Err(err) => {
                let message = format!("cannot open dataset: {err}");
                self.log.append(LogLevel::Error, &message);
                failures.push(message);
                self.log
                    .append(LogLevel::Error, "verification failed: file unreadable");
                self.log.append(LogLevel::Info, &"=".repeat(80));
                return ValidationReport {
                    file: path.to_string(),
                    variables: Vec::new(),
                    detected_year: None,
                    detected_month: None,
                    detected_latitude: None,
                    detected_longitude: None,
                    timesteps: None,
                    warnings,
                    failures,
                    passed: false,
                };
            }
        };

        self.log.append(LogLevel::Info, "[2/5] variable presence");
        let mut variables = Vec::with_capacity(task.variables.len());
        let mut any_missing = false;
        for name in &task.variables {
            let stored_as = self
                .mapping
                .candidates(name)
                .into_iter()
                .find(|candidate| summary.has_variable(candidate))
                .map(str::to_string);
            match &stored_as {
                Some(actual) => {
                    self.log.append(
                        LogLevel::Success,
                        &format!("variable present: {name} (as {actual})"),
                    );
                }
                None => {
                    let message =
                        format!("missing variable: {name} (mapped to {})", self.mapping.resolve(name));
                    self.log.append(LogLevel::Error, &message);
                    failures.push(message);
                    any_missing = true;
                }
            }
            variables.push(VariableCheck {
                name: name.clone(),
                present: stored_as.is_some(),
                stored_as,
                valid_fraction: None,
            });
        }
        if any_missing {
            self.log.append(
                LogLevel::Info,
                &format!("variables in file: {}", summary.variables.join(", ")),
            );
        }

        self.log.append(LogLevel::Info, "[3/5] data completeness");
        for check in &mut variables {
            let Some(actual) = check.stored_as.clone() else {
                continue;
            };
            let Some((valid, total)) = summary.valid_counts.get(&actual).copied() else {
                continue;
            };
            if total == 0 {
                let message = format!("variable {} holds no data", check.name);
                self.log.append(LogLevel::Error, &message);
                failures.push(message);
                continue;
            }
            let fraction = valid as f64 / total as f64;
            check.valid_fraction = Some(fraction);
            self.log.append(
                LogLevel::Success,
                &format!(
                    "{}: {} points, {} valid ({:.1}%)",
                    check.name,
                    total,
                    valid,
                    fraction * 100.0
                ),
            );
        }

        self.log.append(LogLevel::Info, "[4/5] temporal alignment");
        let mut detected_year = None;
        let mut detected_month = None;
        let mut timesteps = None;
        match &summary.time {
            None => {
                let message = "no time coordinate found".to_string();
                self.log.append(LogLevel::Warning, &message);
                warnings.push(message);
            }
            Some(coverage) => {
                self.log.append(
                    LogLevel::Info,
                    &format!(
                        "time coordinate {}: {} .. {} ({} steps)",
                        coverage.coordinate, coverage.first, coverage.last, coverage.count
                    ),
                );
                timesteps = Some(coverage.count);

                let file_year = coverage.first.year();
                detected_year = Some(file_year);
                if file_year != task.year() {
                    let message =
                        format!("year mismatch: expected {}, found {file_year}", task.year());
                    self.log.append(LogLevel::Error, &message);
                    failures.push(message);
                } else {
                    self.log
                        .append(LogLevel::Success, &format!("year matches: {file_year}"));
                }

                if let Some(expected_month) = task.single_month() {
                    let file_month = coverage.first.month();
                    detected_month = Some(file_month);
                    if file_month != expected_month {
                        let message = format!(
                            "month mismatch: expected {expected_month}, found {file_month}"
                        );
                        self.log.append(LogLevel::Error, &message);
                        failures.push(message);
                    } else {
                        self.log
                            .append(LogLevel::Success, &format!("month matches: {file_month}"));
                    }
                }

                let expected = task.expected_timesteps();
                if expected > 0 {
                    let actual = coverage.count;
                    let deviation = (actual as f64 - expected as f64).abs() / expected as f64;
                    if deviation > TIMESTEP_TOLERANCE {
                        let message = format!(
                            "timestep count off: expected {expected}, found {actual} ({:.1}% off)",
                            deviation * 100.0
                        );
                        self.log.append(LogLevel::Warning, &message);
                        warnings.push(message);
                    } else {
                        self.log.append(
                            LogLevel::Success,
                            &format!("timestep count plausible: {actual} (expected {expected})"),
                        );
                    }
                }
            }
        }

        self.log.append(LogLevel::Info, "[5/5] spatial alignment");
        let mut detected_latitude = None;
        let mut detected_longitude = None;
        match task.area {
            None => {
                self.log
                    .append(LogLevel::Info, "global extent, spatial check skipped");
            }
            Some(area) => {
                if let Some((lat_len, lon_len)) = summary.grid {
                    self.log
                        .append(LogLevel::Info, &format!("grid: {lat_len} x {lon_len}"));
                }
                match summary.latitude {
                    Some((found_min, found_max)) => {
                        detected_latitude = Some((found_min, found_max));
                        let (expected_min, expected_max) = area.lat_bounds();
                        let diff = (found_min - expected_min)
                            .abs()
                            .max((found_max - expected_max).abs());
                        if diff > SPATIAL_TOLERANCE_DEG {
                            let message = format!(
                                "latitude bounds off by {diff:.2} deg: expected {expected_min:.2}..{expected_max:.2}, found {found_min:.2}..{found_max:.2}"
                            );
                            self.log.append(LogLevel::Warning, &message);
                            warnings.push(message);
                        } else {
                            self.log.append(
                                LogLevel::Success,
                                &format!("latitude bounds match (within {diff:.2} deg)"),
                            );
                        }
                    }
                    None => {
                        let message = "no latitude coordinate found".to_string();
                        self.log.append(LogLevel::Warning, &message);
                        warnings.push(message);
                    }
                }
                match summary.longitude {
                    Some((found_min, found_max)) => {
                        detected_longitude = Some((found_min, found_max));
                        let (expected_min, expected_max) = area.lon_bounds();
                        let diff = (found_min - expected_min)
                            .abs()
                            .max((found_max - expected_max).abs());
                        if diff > SPATIAL_TOLERANCE_DEG {
                            let message = format!(
                                "longitude bounds off by {diff:.2} deg: expected {expected_min:.2}..{expected_max:.2}, found {found_min:.2}..{found_max:.2}"
                            );
                            self.log.append(LogLevel::Warning, &message);
                            warnings.push(message);
                        } else {
                            self.log.append(
                                LogLevel::Success,
                                &format!("longitude bounds match (within {diff:.2} deg)"),
                            );
                        }
                    }
                    None => {
                        let message = "no longitude coordinate found".to_string();
                        self.log.append(LogLevel::Warning, &message);
                        warnings.push(message);
                    }
                }
            }
        }

        let passed = failures.is_empty();
        if passed {
            self.log.append(LogLevel::Success, "verification passed");
        } else {
            self.log.append(
                LogLevel::Error,
                &format!("verification failed with {} error(s)", failures.len()),
            );
        }
        self.log.append(LogLevel::Info, &"=".repeat(80));

        ValidationReport {
            file: path.to_string(),
            variables,
            detected_year,
            detected_month,
            detected_latitude,
            detected_longitude,
            timesteps,
            warnings,
            failures,
            passed,
        }
    }
}
