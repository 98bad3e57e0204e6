use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::cds::{ArchiveClient, RetrievalRequest};
use crate::dataset::DatasetReader;
use crate::domain::{DownloadTask, TaskState};
use crate::error::TellusError;
use crate::fs_util::{self, ContainerKind};
use crate::mapping::VariableMapping;
use crate::merge::MergeOutcome;
use crate::status::{StateCounts, StatusStore, TaskRecord};
use crate::store::Store;
use crate::verify::{Validator, VerificationLog};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_workers: usize,
    pub retry_times: u32,
    pub retry_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry_times: 3,
            retry_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub key: String,
    pub state: TaskState,
    pub file: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub tasks: Vec<TaskOutcome>,
    pub files: Vec<String>,
    pub counts: StateCounts,
}

/// One configured request's run, with its optional merge.
#[derive(Debug, Clone, Serialize)]
pub struct RequestReport {
    pub name: String,
    pub run: RunResult,
    pub merged: Option<MergeOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub requests: Vec<RequestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub key: String,
    pub file: String,
    pub passed: bool,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub checked: usize,
    pub demoted: Vec<String>,
    pub entries: Vec<VerifyEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub key: String,
    pub status: TaskState,
    pub file: Option<String>,
    pub attempts: u32,
    pub timestamp: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub counts: StateCounts,
    pub tasks: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanResult {
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: ArchiveClient, D: DatasetReader> {
    store: Store,
    client: C,
    reader: D,
    mapping: VariableMapping,
    options: RunOptions,
}

impl<C: ArchiveClient, D: DatasetReader> App<C, D> {
    pub fn new(
        store: Store,
        client: C,
        reader: D,
        mapping: VariableMapping,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            client,
            reader,
            mapping,
            options,
        }
    }

    /// Runs every task not already completed, over a bounded worker pool.
    /// Outcomes and the verified file list come back in input order.
    pub fn fetch(
        &self,
        tasks: &[DownloadTask],
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, TellusError> {
        self.store.ensure_layout()?;
        let status = StatusStore::open(self.store.status_path())?;
        let log = VerificationLog::new(self.store.verification_log_path());
        log.session_start();
        self.execute(tasks, &status, &log, sink)
    }

    /// Re-runs every task the store records as failed.
    pub fn retry_failed(&self, sink: &dyn ProgressSink) -> Result<RunResult, TellusError> {
        self.store.ensure_layout()?;
        let status = StatusStore::open(self.store.status_path())?;
        let failed = status.failed_records();
        if failed.is_empty() {
            sink.event(ProgressEvent {
                message: "phase=Resolve; nothing to retry".to_string(),
                elapsed: None,
            });
            return Ok(RunResult {
                tasks: Vec::new(),
                files: Vec::new(),
                counts: status.counts(),
            });
        }
        let log = VerificationLog::new(self.store.verification_log_path());
        log.session_start();
        let tasks: Vec<DownloadTask> = failed.into_iter().map(|(_, record)| record.task).collect();
        self.execute(&tasks, &status, &log, sink)
    }

    /// Re-checks every completed record against its file on disk, demoting
    /// records whose file is missing or no longer passes. Demotion leaves the
    /// attempt count untouched.
    pub fn verify_completed(&self, sink: &dyn ProgressSink) -> Result<VerifyResult, TellusError> {
        self.store.ensure_layout()?;
        let status = StatusStore::open(self.store.status_path())?;
        let log = VerificationLog::new(self.store.verification_log_path());
        log.session_start();
        let validator = Validator::new(&self.reader, &self.mapping, &log);

        let mut entries = Vec::new();
        let mut demoted = Vec::new();
        for (key, record) in status.records() {
            if record.status != TaskState::Completed {
                continue;
            }
            sink.event(ProgressEvent {
                message: format!("phase=Verify; {key}"),
                elapsed: None,
            });
            let path = record
                .file
                .clone()
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| self.store.task_path(&record.task));

            if !self.store.exists(&path) {
                let failure = format!("output file missing: {path}");
                let mut updated = record.clone();
                updated.status = TaskState::Failed;
                updated.error = Some(failure.clone());
                updated.timestamp = iso_timestamp();
                status.upsert(&key, updated)?;
                demoted.push(key.to_string());
                entries.push(VerifyEntry {
                    key: key.to_string(),
                    file: path.to_string(),
                    passed: false,
                    failures: vec![failure],
                    warnings: Vec::new(),
                });
                continue;
            }

            let report = validator.verify(&path, &record.task);
            if !report.passed {
                let mut updated = record.clone();
                updated.status = TaskState::Failed;
                updated.error = Some(format!("validation failed: {}", report.failures.join("; ")));
                updated.timestamp = iso_timestamp();
                status.upsert(&key, updated)?;
                demoted.push(key.to_string());
            }
            entries.push(VerifyEntry {
                key: key.to_string(),
                file: report.file,
                passed: report.passed,
                failures: report.failures,
                warnings: report.warnings,
            });
        }

        Ok(VerifyResult {
            checked: entries.len(),
            demoted,
            entries,
        })
    }

    pub fn status_summary(&self) -> Result<StatusResult, TellusError> {
        let status = StatusStore::open(self.store.status_path())?;
        let tasks = status
            .records()
            .into_iter()
            .map(|(key, record)| StatusEntry {
                key: key.to_string(),
                status: record.status,
                file: record.file,
                attempts: record.attempts,
                timestamp: record.timestamp,
                error: record.error,
            })
            .collect();
        Ok(StatusResult {
            counts: status.counts(),
            tasks,
        })
    }

    pub fn clean_temp(&self, sink: &dyn ProgressSink) -> Result<CleanResult, TellusError> {
        sink.event(ProgressEvent {
            message: "phase=Store; clearing staging area".to_string(),
            elapsed: None,
        });
        let removed = self.store.clear_temp()?;
        Ok(CleanResult { removed })
    }

    /// Concatenates the given files, in order, into a file under the
    /// output root.
    pub fn merge_files(
        &self,
        inputs: &[Utf8PathBuf],
        output_name: &str,
        sink: &dyn ProgressSink,
    ) -> Result<MergeOutcome, TellusError> {
        self.store.ensure_layout()?;
        let destination = self.store.merged_path(output_name);
        sink.event(ProgressEvent {
            message: format!("phase=Merge; {} files -> {output_name}", inputs.len()),
            elapsed: None,
        });
        let outcome = crate::merge::merge_along_time(inputs, &destination)?;
        sink.event(ProgressEvent {
            message: format!("phase=Merge; wrote {} records", outcome.records),
            elapsed: None,
        });
        Ok(outcome)
    }

    /// Merges every completed record's file, in key (chronological) order.
    pub fn merge_completed(
        &self,
        output_name: &str,
        sink: &dyn ProgressSink,
    ) -> Result<MergeOutcome, TellusError> {
        let status = StatusStore::open(self.store.status_path())?;
        let inputs: Vec<Utf8PathBuf> = status
            .records()
            .into_iter()
            .filter(|(_, record)| record.status == TaskState::Completed)
            .filter_map(|(_, record)| record.file.map(Utf8PathBuf::from))
            .collect();
        if inputs.is_empty() {
            return Err(TellusError::Merge(
                "no completed downloads to merge".to_string(),
            ));
        }
        self.merge_files(&inputs, output_name, sink)
    }

    fn execute(
        &self,
        tasks: &[DownloadTask],
        status: &StatusStore,
        log: &VerificationLog,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, TellusError> {
        let completed = status.completed_keys();
        let outcomes: Mutex<Vec<Option<TaskOutcome>>> = Mutex::new(vec![None; tasks.len()]);
        let mut pending: Vec<(usize, &DownloadTask)> = Vec::new();

        for (idx, task) in tasks.iter().enumerate() {
            if completed.contains(&task.key) {
                sink.event(ProgressEvent {
                    message: format!("phase=Resolve; {} already completed", task.key),
                    elapsed: None,
                });
                let (file, attempts) = match status.get(&task.key) {
                    Some(record) => (record.file, record.attempts),
                    None => (None, 0),
                };
                let outcome = TaskOutcome {
                    key: task.key.to_string(),
                    state: TaskState::Completed,
                    file,
                    attempts,
                    error: None,
                    warnings: Vec::new(),
                };
                if let Ok(mut slots) = outcomes.lock() {
                    slots[idx] = Some(outcome);
                }
            } else {
                pending.push((idx, task));
            }
        }

        if !pending.is_empty() {
            let workers = self.options.max_workers.max(1).min(pending.len());
            let cursor = AtomicUsize::new(0);
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| {
                        loop {
                            let slot = cursor.fetch_add(1, Ordering::SeqCst);
                            let Some(&(idx, task)) = pending.get(slot) else {
                                break;
                            };
                            let outcome = match self.run_task(task, status, log, sink) {
                                Ok(outcome) => outcome,
                                Err(err) => TaskOutcome {
                                    key: task.key.to_string(),
                                    state: TaskState::Failed,
                                    file: None,
                                    attempts: 0,
                                    error: Some(err.to_string()),
                                    warnings: Vec::new(),
                                },
                            };
                            if let Ok(mut slots) = outcomes.lock() {
                                slots[idx] = Some(outcome);
                            }
                        }
                    });
                }
            });
        }

        let outcomes = match outcomes.into_inner() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let tasks: Vec<TaskOutcome> = outcomes.into_iter().flatten().collect();
        let files = tasks
            .iter()
            .filter(|outcome| outcome.state == TaskState::Completed)
            .filter_map(|outcome| outcome.file.clone())
            .collect();
        Ok(RunResult {
            tasks,
            files,
            counts: status.counts(),
        })
    }

    /// One task end to end: reuse, download with retries, unpack, promote,
    /// verify. Only the network step retries; a malformed container or a
    /// failed verification settles the task at the current attempt.
    fn run_task(
        &self,
        task: &DownloadTask,
        status: &StatusStore,
        log: &VerificationLog,
        sink: &dyn ProgressSink,
    ) -> Result<TaskOutcome, TellusError> {
        let key = &task.key;
        let destination = self.store.task_path(task);
        let validator = Validator::new(&self.reader, &self.mapping, log);

        if self.store.exists(&destination) {
            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {key} output already on disk"),
                elapsed: None,
            });
            let report = validator.verify(&destination, task);
            if report.passed {
                let attempts = status.get(key).map(|record| record.attempts).unwrap_or(0);
                self.record_state(
                    status,
                    task,
                    TaskState::Completed,
                    Some(destination.to_string()),
                    attempts,
                    None,
                )?;
                return Ok(TaskOutcome {
                    key: key.to_string(),
                    state: TaskState::Completed,
                    file: Some(destination.to_string()),
                    attempts,
                    error: None,
                    warnings: report.warnings,
                });
            }
            sink.event(ProgressEvent {
                message: format!("phase=Resolve; {key} existing output failed checks, downloading again"),
                elapsed: None,
            });
        }

        let request = RetrievalRequest::from_task(task);
        let total_attempts = self.options.retry_times.max(1);
        let mut last_error = String::new();

        for attempt in 1..=total_attempts {
            self.record_state(status, task, TaskState::InProgress, None, attempt, None)?;
            sink.event(ProgressEvent {
                message: format!("phase=Retrieve; {key} attempt {attempt}/{total_attempts}"),
                elapsed: None,
            });

            let staging = tempfile::Builder::new()
                .prefix("tellus-cm-task")
                .tempdir_in(self.store.temp_dir().as_std_path())
                .map_err(|err| TellusError::Filesystem(err.to_string()))?;
            let artifact = staging.path().join("download.bin");

            sink.event(ProgressEvent {
                message: "archive.request".to_string(),
                elapsed: None,
            });
            let start = Instant::now();
            let fetched = self.client.retrieve(&request, &artifact);
            let latency = start.elapsed().as_millis();
            sink.event(ProgressEvent {
                message: format!("archive.response latency_ms={latency}"),
                elapsed: None,
            });

            if let Err(err) = fetched {
                last_error = err.to_string();
                tracing::warn!("task {key} attempt {attempt} failed: {last_error}");
                if attempt < total_attempts {
                    let delay = self.options.retry_delay * attempt;
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Retrieve; {key} retrying in {}s",
                            delay.as_secs()
                        ),
                        elapsed: None,
                    });
                    std::thread::sleep(delay);
                    continue;
                }
                self.record_state(
                    status,
                    task,
                    TaskState::Failed,
                    None,
                    attempt,
                    Some(last_error.clone()),
                )?;
                return Ok(TaskOutcome {
                    key: key.to_string(),
                    state: TaskState::Failed,
                    file: None,
                    attempts: attempt,
                    error: Some(last_error),
                    warnings: Vec::new(),
                });
            }

            let nc_file = match self.unpack(&artifact, staging.path()) {
                Ok(path) => path,
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!("task {key} artifact rejected: {message}");
                    self.record_state(
                        status,
                        task,
                        TaskState::Failed,
                        None,
                        attempt,
                        Some(message.clone()),
                    )?;
                    return Ok(TaskOutcome {
                        key: key.to_string(),
                        state: TaskState::Failed,
                        file: None,
                        attempts: attempt,
                        error: Some(message),
                        warnings: Vec::new(),
                    });
                }
            };

            sink.event(ProgressEvent {
                message: format!("phase=Store; {key} writing {}", task.output_filename()),
                elapsed: None,
            });
            let source = Utf8PathBuf::from_path_buf(nc_file)
                .map_err(|_| TellusError::Filesystem("non-utf8 path in staging area".to_string()))?;
            Store::promote_file(&source, &destination)?;

            sink.event(ProgressEvent {
                message: format!("phase=Verify; {key} checking {}", task.output_filename()),
                elapsed: None,
            });
            let report = validator.verify(&destination, task);
            if report.passed {
                self.record_state(
                    status,
                    task,
                    TaskState::Completed,
                    Some(destination.to_string()),
                    attempt,
                    None,
                )?;
                return Ok(TaskOutcome {
                    key: key.to_string(),
                    state: TaskState::Completed,
                    file: Some(destination.to_string()),
                    attempts: attempt,
                    error: None,
                    warnings: report.warnings,
                });
            }

            let message = format!("validation failed: {}", report.failures.join("; "));
            self.record_state(
                status,
                task,
                TaskState::Failed,
                Some(destination.to_string()),
                attempt,
                Some(message.clone()),
            )?;
            return Ok(TaskOutcome {
                key: key.to_string(),
                state: TaskState::Failed,
                file: Some(destination.to_string()),
                attempts: attempt,
                error: Some(message),
                warnings: report.warnings,
            });
        }

        self.record_state(
            status,
            task,
            TaskState::Failed,
            None,
            total_attempts,
            Some(last_error.clone()),
        )?;
        Ok(TaskOutcome {
            key: key.to_string(),
            state: TaskState::Failed,
            file: None,
            attempts: total_attempts,
            error: Some(last_error),
            warnings: Vec::new(),
        })
    }

    fn unpack(&self, artifact: &Path, staging: &Path) -> Result<PathBuf, TellusError> {
        match fs_util::detect_container(artifact)? {
            ContainerKind::Zip => {
                let extract_dir = staging.join("extract");
                std::fs::create_dir_all(&extract_dir)
                    .map_err(|err| TellusError::Filesystem(err.to_string()))?;
                fs_util::extract_zip(artifact, &extract_dir)?;
                fs_util::sole_netcdf_file(&extract_dir)
            }
            ContainerKind::Gzip => {
                let dest = staging.join("data.nc");
                fs_util::extract_gzip(artifact, &dest)?;
                Ok(dest)
            }
            ContainerKind::Plain => Ok(artifact.to_path_buf()),
        }
    }

    fn record_state(
        &self,
        status: &StatusStore,
        task: &DownloadTask,
        state: TaskState,
        file: Option<String>,
        attempts: u32,
        error: Option<String>,
    ) -> Result<(), TellusError> {
        status.upsert(
            &task.key,
            TaskRecord {
                status: state,
                file,
                timestamp: iso_timestamp(),
                variables: task.variables.clone(),
                attempts,
                error,
                task: task.clone(),
            },
        )
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
