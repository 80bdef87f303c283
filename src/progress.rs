//! Job progress persisted as `<workDir>/progress.json`.
//!
//! External pollers read the file without talking to the running job, so
//! every update replaces it atomically (write to a temp file in the same
//! directory, then rename). Updates are serialized through a mutex; the
//! completed count never decreases and never passes the total.
//!
//! ```json
//! {"jobId":"abc","total":3,"done":1,"status":"processing","updatedAt":"2026-01-01T12:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot replace {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub job_id: String,
    pub total: usize,
    pub done: usize,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(job_id: impl Into<String>, total: usize) -> Self {
        Self {
            job_id: job_id.into(),
            total,
            done: 0,
            status: JobStatus::Queued,
            updated_at: Utc::now(),
        }
    }

    /// `round(done / total * 100)`; 0 for an empty job.
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.done as f64 / self.total as f64) * 100.0).round() as u32
    }
}

pub fn progress_path(work_dir: &Path) -> PathBuf {
    work_dir.join(PROGRESS_FILE)
}

pub fn read_progress(work_dir: &Path) -> Result<ProgressRecord, ProgressError> {
    let content = std::fs::read_to_string(progress_path(work_dir))?;
    Ok(serde_json::from_str(&content)?)
}

fn write_atomic(path: &Path, record: &ProgressRecord) -> Result<(), ProgressError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".progress-")
        .suffix(".json")
        .tempfile_in(dir)?;
    serde_json::to_writer(&mut tmp, record)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| ProgressError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// The single writer of one job's progress record.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    record: Mutex<ProgressRecord>,
}

impl ProgressTracker {
    /// Create the record in `queued` state and write it.
    pub fn create(work_dir: &Path, job_id: &str, total: usize) -> Result<Self, ProgressError> {
        let tracker = Self {
            path: progress_path(work_dir),
            record: Mutex::new(ProgressRecord::new(job_id, total)),
        };
        tracker.update(|_| {})?;
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> Result<ProgressRecord, ProgressError> {
        self.update(|r| r.status = JobStatus::Processing)
    }

    /// Count one more finished file (converted or placeholder).
    pub fn complete_one(&self) -> Result<ProgressRecord, ProgressError> {
        self.update(|r| r.done = (r.done + 1).min(r.total))
    }

    pub fn finish(&self) -> Result<ProgressRecord, ProgressError> {
        self.update(|r| r.status = JobStatus::Done)
    }

    pub fn snapshot(&self) -> ProgressRecord {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ProgressRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `change` and persist while holding the lock, so the file
    /// always reflects the latest in-memory state.
    fn update(&self, change: impl FnOnce(&mut ProgressRecord)) -> Result<ProgressRecord, ProgressError> {
        let mut record = self.lock();
        change(&mut record);
        record.updated_at = Utc::now();
        write_atomic(&self.path, &record)?;
        Ok(record.clone())
    }
}
