use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DownloadTask, TaskKey, TaskState};
use crate::error::TellusError;
use crate::store::Store;

/// One persisted lifecycle record per task key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskState,
    pub file: Option<String>,
    pub timestamp: String,
    pub variables: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    pub error: Option<String>,
    pub task: DownloadTask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// Durable task-state map backing resume and retry. The whole map is
/// persisted on every upsert via atomic temp-file replace; a missing file is
/// a fresh run, a file that fails to parse is an error.
#[derive(Debug)]
pub struct StatusStore {
    path: Utf8PathBuf,
    inner: Mutex<BTreeMap<String, TaskRecord>>,
}

impl StatusStore {
    pub fn open(path: Utf8PathBuf) -> Result<Self, TellusError> {
        let mut records: BTreeMap<String, TaskRecord> = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| TellusError::StatusStore(err.to_string()))?;
            serde_json::from_str(&content)
                .map_err(|err| TellusError::StatusStore(format!("{path}: {err}")))?
        } else {
            BTreeMap::new()
        };

        // A record left in_progress belongs to an interrupted run.
        for record in records.values_mut() {
            if record.status == TaskState::InProgress {
                record.status = TaskState::Pending;
            }
        }

        Ok(Self {
            path,
            inner: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }

    pub fn upsert(&self, key: &TaskKey, record: TaskRecord) -> Result<(), TellusError> {
        let mut records = self
            .inner
            .lock()
            .map_err(|_| TellusError::StatusStore("status store lock poisoned".to_string()))?;
        records.insert(key.as_str().to_string(), record);
        let content = serde_json::to_vec_pretty(&*records)
            .map_err(|err| TellusError::StatusStore(err.to_string()))?;
        Store::write_bytes_atomic(&self.path, &content)?;
        Ok(())
    }

    pub fn get(&self, key: &TaskKey) -> Option<TaskRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|records| records.get(key.as_str()).cloned())
    }

    /// Records in key order.
    pub fn records(&self) -> Vec<(TaskKey, TaskRecord)> {
        self.inner
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|(key, record)| {
                        key.parse::<TaskKey>().ok().map(|key| (key, record.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn completed_keys(&self) -> HashSet<TaskKey> {
        self.inner
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, record)| record.status == TaskState::Completed)
                    .filter_map(|(key, _)| key.parse::<TaskKey>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn failed_records(&self) -> Vec<(TaskKey, TaskRecord)> {
        self.records()
            .into_iter()
            .filter(|(_, record)| record.status == TaskState::Failed)
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for (_, record) in self.records() {
            match record.status {
                TaskState::Pending => counts.pending += 1,
                TaskState::InProgress => counts.in_progress += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
