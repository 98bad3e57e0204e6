use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::domain::{DownloadTask, format_hour};
use crate::error::TellusError;

pub const DEFAULT_ARCHIVE_URL: &str = "https://cds.climate.copernicus.eu/api/v2";
pub const DATASET: &str = "reanalysis-era5-land";

/// Wire form of one retrieval request: every field a string list, hours as
/// `HH:00`, area in north/west/south/east order.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievalRequest {
    pub variable: Vec<String>,
    pub year: String,
    pub month: Vec<String>,
    pub day: Vec<String>,
    pub time: Vec<String>,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<[f64; 4]>,
}

impl RetrievalRequest {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            variable: task.variables.clone(),
            year: task.year().to_string(),
            month: task.months.iter().map(|m| format!("{m:02}")).collect(),
            day: task.days.iter().map(|d| format!("{d:02}")).collect(),
            time: task.hours.iter().map(|h| format_hour(*h)).collect(),
            format: "netcdf".to_string(),
            area: task.area.map(Into::into),
        }
    }
}

/// One blocking retrieval per call; retry scheduling belongs to the caller.
pub trait ArchiveClient: Send + Sync {
    fn retrieve(&self, request: &RetrievalRequest, destination: &Path) -> Result<(), TellusError>;
}

#[derive(Clone)]
pub struct CdsHttpClient {
    client: Client,
    base_url: String,
}

impl CdsHttpClient {
    pub fn new(base_url: Option<String>, api_token: Option<String>) -> Result<Self, TellusError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("tellus-cm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TellusError::Retrieval(err.to_string()))?,
        );

        let token = api_token.or_else(|| std::env::var("CDS_API_TOKEN").ok());
        if let Some(token) = token {
            if !token.trim().is_empty() {
                headers.insert(
                    "PRIVATE-TOKEN",
                    HeaderValue::from_str(token.trim())
                        .map_err(|err| TellusError::Retrieval(err.to_string()))?,
                );
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| TellusError::Retrieval(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_ARCHIVE_URL.to_string()),
        })
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<(), TellusError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "archive request failed".to_string());
            return Err(TellusError::Retrieval(format!("HTTP {status}: {message}")));
        }
        let mut file =
            File::create(destination).map_err(|err| TellusError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| TellusError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl ArchiveClient for CdsHttpClient {
    fn retrieve(&self, request: &RetrievalRequest, destination: &Path) -> Result<(), TellusError> {
        let url = format!("{}/resources/{}", self.base_url, DATASET);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|err| TellusError::Retrieval(err.to_string()))?;
        self.write_response_to_file(response, destination)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::domain::{BoundingBox, TaskKey};

    #[test]
    fn request_fields_are_zero_padded() {
        let task = DownloadTask {
            key: TaskKey::for_month(2014, 1),
            variables: vec!["2m_temperature".to_string()],
            start: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2014, 1, 5).unwrap(),
            months: vec![1],
            days: vec![1, 2, 3, 4, 5],
            hours: vec![0, 6, 12, 18],
            area: Some(BoundingBox::new(60.0, 70.0, 10.0, 140.0).unwrap()),
        };
        let request = RetrievalRequest::from_task(&task);

        assert_eq!(request.year, "2014");
        assert_eq!(request.month, vec!["01"]);
        assert_eq!(request.day, vec!["01", "02", "03", "04", "05"]);
        assert_eq!(request.time, vec!["00:00", "06:00", "12:00", "18:00"]);
        assert_eq!(request.area, Some([60.0, 70.0, 10.0, 140.0]));

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["format"], "netcdf");
        assert_eq!(value["variable"][0], "2m_temperature");
    }

    #[test]
    fn global_request_omits_area() {
        let task = DownloadTask {
            key: TaskKey::for_month(2014, 2),
            variables: vec!["total_precipitation".to_string()],
            start: NaiveDate::from_ymd_opt(2014, 2, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2014, 2, 28).unwrap(),
            months: vec![2],
            days: (1..=28).collect(),
            hours: vec![0],
            area: None,
        };
        let value = serde_json::to_value(RetrievalRequest::from_task(&task)).unwrap();
        assert!(value.get("area").is_none());
    }
}
