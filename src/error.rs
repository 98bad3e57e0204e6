use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TellusError {
    #[error("invalid date range: end {end} precedes start {start}")]
    InvalidRange { start: String, end: String },

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("invalid area (expected [north, west, south, east] with north >= south): {0}")]
    InvalidArea(String),

    #[error("invalid hour (expected 0-23 or HH:00): {0}")]
    InvalidHour(String),

    #[error("invalid task key: {0}")]
    InvalidKey(String),

    #[error("missing config file tellus-cm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("archive retrieval failed: {0}")]
    Retrieval(String),

    #[error("container extraction failed: {0}")]
    ContainerExtraction(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("merge inputs are incompatible: {0}")]
    MergeMismatch(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("dataset read failed for {path}: {message}")]
    Dataset { path: String, message: String },

    #[error("status store error: {0}")]
    StatusStore(String),

    #[error("task not found in status store: {0}")]
    TaskNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
