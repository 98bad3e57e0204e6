use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::NaiveDate;

use tellus_climate_manager::app::{App, RunOptions};
use tellus_climate_manager::cds::{ArchiveClient, RetrievalRequest};
use tellus_climate_manager::dataset::NetcdfDatasetReader;
use tellus_climate_manager::domain::{BoundingBox, SplitGranularity, TaskState};
use tellus_climate_manager::error::TellusError;
use tellus_climate_manager::mapping::VariableMapping;
use tellus_climate_manager::netcdf::{
    Attribute, Dimension, ModelVar, NcModel, NcReader, NcType, VarData, write_classic,
};
use tellus_climate_manager::output::JsonOutput;
use tellus_climate_manager::split::build_tasks;
use tellus_climate_manager::status::StatusStore;
use tellus_climate_manager::store::Store;

/// Serves synthetic but wire-correct files: one record per requested
/// day/hour pair, grid taken from the request area. The call counter is
/// shared so tests can read it after the client moves into the app.
#[derive(Default, Clone)]
struct SynthArchive {
    calls: Arc<Mutex<usize>>,
}

impl ArchiveClient for SynthArchive {
    fn retrieve(&self, request: &RetrievalRequest, destination: &Path) -> Result<(), TellusError> {
        *self.calls.lock().unwrap() += 1;
        write_classic(destination, &archive_model(request))
    }
}

#[derive(Default)]
struct DownArchive;

impl ArchiveClient for DownArchive {
    fn retrieve(&self, _request: &RetrievalRequest, _destination: &Path) -> Result<(), TellusError> {
        Err(TellusError::Retrieval("HTTP 503: queue full".to_string()))
    }
}

fn archive_model(request: &RetrievalRequest) -> NcModel {
    let year: i32 = request.year.parse().unwrap();
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();

    let mut times = Vec::new();
    for month in &request.month {
        let month: u32 = month.parse().unwrap();
        for day in &request.day {
            let day: u32 = day.parse().unwrap();
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            for time in &request.time {
                let hour: u32 = time[..2].parse().unwrap();
                let stamp = date.and_hms_opt(hour, 0, 0).unwrap();
                times.push((stamp - epoch).num_hours() as f64);
            }
        }
    }

    let [north, west, south, east] = request.area.unwrap_or([60.0, 70.0, 10.0, 140.0]);
    let records = times.len();
    let temps: Vec<f64> = (0..records * 4).map(|i| 260.0 + (i % 40) as f64).collect();

    NcModel {
        dimensions: vec![
            Dimension::unlimited("time"),
            Dimension::fixed("latitude", 2),
            Dimension::fixed("longitude", 2),
        ],
        attributes: vec![Attribute::text("Conventions", "CF-1.6")],
        variables: vec![
            ModelVar {
                name: "time".to_string(),
                dims: vec![0],
                attributes: vec![Attribute::text("units", "hours since 1900-01-01 00:00:00.0")],
                nc_type: NcType::Int,
                data: VarData::Numeric(times),
            },
            ModelVar {
                name: "latitude".to_string(),
                dims: vec![1],
                attributes: Vec::new(),
                nc_type: NcType::Double,
                data: VarData::Numeric(vec![north, south]),
            },
            ModelVar {
                name: "longitude".to_string(),
                dims: vec![2],
                attributes: Vec::new(),
                nc_type: NcType::Double,
                data: VarData::Numeric(vec![west, east]),
            },
            ModelVar {
                name: "t2m".to_string(),
                dims: vec![0, 1, 2],
                attributes: vec![Attribute::text("units", "K")],
                nc_type: NcType::Double,
                data: VarData::Numeric(temps),
            },
        ],
    }
}

fn test_store(dir: &tempfile::TempDir) -> Store {
    Store::at(Utf8PathBuf::from_path_buf(dir.path().join("ERA5_Land_data")).unwrap())
}

fn test_options() -> RunOptions {
    RunOptions {
        max_workers: 2,
        retry_times: 3,
        retry_delay: Duration::ZERO,
    }
}

fn jan_feb_tasks() -> Vec<tellus_climate_manager::domain::DownloadTask> {
    build_tasks(
        &["2m_temperature".to_string()],
        NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2014, 2, 28).unwrap(),
        Some(BoundingBox::new(60.0, 70.0, 10.0, 140.0).unwrap()),
        &[0],
        SplitGranularity::Month,
    )
    .unwrap()
}

#[test]
fn fetch_downloads_real_files_and_persists_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = test_store(&dir);
    let app = App::new(
        store,
        SynthArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );

    let tasks = jan_feb_tasks();
    assert_eq!(tasks.len(), 2);

    let result = app.fetch(&tasks, &JsonOutput).unwrap();
    assert_eq!(result.counts.completed, 2);
    assert_eq!(result.counts.failed, 0);
    assert_eq!(result.files.len(), 2);

    // January was split to 31 days at one hour each.
    let nc = NcReader::open(Path::new(&result.files[0])).unwrap();
    assert_eq!(nc.num_records, 31);

    let store = test_store(&dir);
    let status = StatusStore::open(store.status_path()).unwrap();
    let record = status.get(&"201401".parse().unwrap()).unwrap();
    assert_eq!(record.status, TaskState::Completed);
    assert_eq!(record.attempts, 1);
    assert!(record.file.as_deref().unwrap().ends_with("ERA5_Land_2m_temperature_201401.nc"));
    assert!(store.verification_log_path().as_std_path().exists());
}

#[test]
fn second_fetch_resumes_without_downloading() {
    let dir = tempfile::tempdir().unwrap();
    let archive = SynthArchive::default();
    let calls = archive.calls.clone();
    let app = App::new(
        test_store(&dir),
        archive,
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );

    let tasks = jan_feb_tasks();
    app.fetch(&tasks, &JsonOutput).unwrap();
    let result = app.fetch(&tasks, &JsonOutput).unwrap();

    assert_eq!(*calls.lock().unwrap(), 2);
    assert_eq!(result.counts.completed, 2);
    assert!(result.tasks.iter().all(|t| t.state == TaskState::Completed));
}

#[test]
fn exhausted_retries_leave_a_failed_record_that_retry_clears() {
    let dir = tempfile::tempdir().unwrap();
    let tasks = jan_feb_tasks();

    let down = App::new(
        test_store(&dir),
        DownArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );
    let result = down.fetch(&tasks[..1], &JsonOutput).unwrap();
    assert_eq!(result.counts.failed, 1);
    assert!(result.files.is_empty());
    assert_eq!(result.tasks[0].attempts, 3);
    assert!(result.tasks[0].error.as_deref().unwrap().contains("503"));

    // A fresh client over the same store picks the failure back up.
    let healthy = App::new(
        test_store(&dir),
        SynthArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );
    let result = healthy.retry_failed(&JsonOutput).unwrap();
    assert_eq!(result.counts.completed, 1);
    assert_eq!(result.counts.failed, 0);
    assert_eq!(result.tasks[0].attempts, 1);
}

#[test]
fn verify_demotes_corrupted_files_and_retry_restores_them() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        test_store(&dir),
        SynthArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );

    let tasks = jan_feb_tasks();
    let result = app.fetch(&tasks, &JsonOutput).unwrap();

    fs::write(&result.files[0], b"scrambled by a failing disk").unwrap();

    let verify = app.verify_completed(&JsonOutput).unwrap();
    assert_eq!(verify.checked, 2);
    assert_eq!(verify.demoted, vec!["201401".to_string()]);
    let entry = verify.entries.iter().find(|e| e.key == "201401").unwrap();
    assert!(!entry.passed);

    let result = app.retry_failed(&JsonOutput).unwrap();
    assert_eq!(result.counts.completed, 2);
    assert_eq!(result.counts.failed, 0);
    let nc = NcReader::open(Path::new(&result.files[0])).unwrap();
    assert_eq!(nc.num_records, 31);
}

#[test]
fn merge_completed_joins_months_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        test_store(&dir),
        SynthArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );

    app.fetch(&jan_feb_tasks(), &JsonOutput).unwrap();
    let outcome = app
        .merge_completed("ERA5_Land_combined.nc", &JsonOutput)
        .unwrap();

    assert_eq!(outcome.files, 2);
    assert_eq!(outcome.records, 31 + 28);
    assert!(outcome.output.ends_with("ERA5_Land_combined.nc"));

    let mut nc = NcReader::open(Path::new(&outcome.output)).unwrap();
    assert_eq!(nc.num_records, 59);
    let time_idx = nc.find("time").unwrap();
    let times = nc.read_values(time_idx).unwrap();
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let jan_first = (NaiveDate::from_ymd_opt(2014, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        - epoch)
        .num_hours() as f64;
    let feb_last = (NaiveDate::from_ymd_opt(2014, 2, 28)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        - epoch)
        .num_hours() as f64;
    assert_eq!(times.first().copied(), Some(jan_first));
    assert_eq!(times.last().copied(), Some(feb_last));
}

#[test]
fn merge_with_nothing_completed_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = App::new(
        test_store(&dir),
        SynthArchive::default(),
        NetcdfDatasetReader,
        VariableMapping::default(),
        test_options(),
    );

    let err = app
        .merge_completed("ERA5_Land_combined.nc", &JsonOutput)
        .unwrap_err();
    assert!(matches!(err, TellusError::Merge(_)));
}
