use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use tellus_climate_manager::config::{Config, ConfigLoader, RequestEntry, Settings};
use tellus_climate_manager::domain::SplitGranularity;
use tellus_climate_manager::error::TellusError;

#[test]
fn load_document_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tellus-cm.json");
    fs::write(
        &path,
        r#"{
            "settings": {
                "output_dir": "/data/era5",
                "max_workers": 8,
                "retry_times": 5,
                "retry_delay_secs": 30,
                "archive_url": "https://archive.example/api",
                "api_token": "abc123"
            },
            "variable_mapping": {
                "lake_depth": "dl"
            },
            "requests": [
                {
                    "name": "temperature_2014",
                    "variables": ["2m_temperature"],
                    "start_date": "2014-01-01",
                    "end_date": "2014-12-31",
                    "area": [60.0, 70.0, 10.0, 140.0],
                    "hours": ["00:00", "12:00"],
                    "split_by": "year",
                    "merge": true,
                    "merged_name": "temp_2014.nc"
                },
                {
                    "name": "parked",
                    "enabled": false,
                    "variables": ["total_precipitation"],
                    "start_date": "2015-01-01",
                    "end_date": "2015-01-31"
                }
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();

    assert_eq!(resolved.output_dir, Some(Utf8PathBuf::from("/data/era5")));
    assert_eq!(resolved.options.max_workers, 8);
    assert_eq!(resolved.options.retry_times, 5);
    assert_eq!(resolved.options.retry_delay, Duration::from_secs(30));
    assert_eq!(resolved.archive_url.as_deref(), Some("https://archive.example/api"));
    assert_eq!(resolved.api_token.as_deref(), Some("abc123"));
    assert_eq!(resolved.mapping.resolve("lake_depth"), "dl");
    assert_eq!(resolved.mapping.resolve("2m_temperature"), "t2m");

    // The disabled request is dropped at resolution.
    assert_eq!(resolved.requests.len(), 1);
    let request = &resolved.requests[0];
    assert_eq!(request.name, "temperature_2014");
    assert_eq!(request.hours, vec![0, 12]);
    assert_eq!(request.split_by, SplitGranularity::Year);
    assert!(request.merge);
    assert_eq!(request.merged_name.as_deref(), Some("temp_2014.nc"));

    let tasks = request.tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].key.as_str(), "2014");
    assert_eq!(tasks[0].months, (1..=12).collect::<Vec<_>>());
}

#[test]
fn explicit_missing_path_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nowhere.json");
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, TellusError::ConfigRead(_));
}

#[test]
fn invalid_json_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tellus-cm.json");
    fs::write(&path, b"{\"settings\": [1, 2").unwrap();
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, TellusError::ConfigParse(_));
}

#[test]
fn bare_document_falls_back_to_defaults() {
    let config = Config {
        settings: Settings::default(),
        variable_mapping: HashMap::new(),
        requests: vec![RequestEntry {
            name: "minimal".to_string(),
            enabled: true,
            variables: vec!["snow_depth".to_string()],
            start_date: "2020-06-01".to_string(),
            end_date: "2020-06-30".to_string(),
            area: None,
            hours: None,
            split_by: None,
            merge: false,
            merged_name: None,
        }],
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.output_dir, None);
    assert_eq!(resolved.options.max_workers, 4);
    assert_eq!(resolved.options.retry_times, 3);
    assert_eq!(resolved.options.retry_delay, Duration::from_secs(10));

    let request = &resolved.requests[0];
    assert_eq!(request.hours.len(), 24);
    assert_eq!(request.split_by, SplitGranularity::Month);
    assert_eq!(resolved.mapping.resolve("snow_depth"), "sd");
}
