//! Batch orchestration: one job descriptor in, one outcome out.
//!
//! ```text
//! validate → create work dir → progress (queued) → probe tools
//!          → progress (processing) → convert every file → zip → progress (done)
//! ```
//!
//! Per-file failures never reach this level; they become placeholders inside
//! the archive. A batch-level failure (invalid descriptor, unusable work
//! directory, archive error, timeout) removes the work directory and yields
//! a failed [`JobOutcome`] with no archive.
//!
//! [`spawn_job`] runs a job on its own thread and [`JobHandle::wait`]
//! enforces the batch timeout: when it trips, the shared [`CancelToken`]
//! kills running tools and stops scheduling further files.

use crate::archive::{ARCHIVE_NAME, ArchiveError, write_archive};
use crate::config::{ConverterConfig, ProcessingMode, effective_workers};
use crate::format::{FormatClass, TargetFormat, classify, output_names};
use crate::process::{ConversionResult, Converter};
use crate::progress::{ProgressError, ProgressTracker};
use crate::tools::probe::cached_probe;
use crate::tools::{CancelToken, SystemRunner, ToolRunner};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid job: {0}")]
    InvalidJob(String),
    #[error("cannot use work directory {}: {source}", .path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive failed: {0}")]
    Archive(#[from] ArchiveError),
    #[error("progress update failed: {0}")]
    Progress(#[from] ProgressError),
    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Conversion timed out")]
    TimedOut,
    #[error("conversion cancelled")]
    Cancelled,
    #[error("conversion worker panicked")]
    WorkerPanicked,
}

// ============================================================================
// Job descriptor and outcome
// ============================================================================

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFile {
    pub path: PathBuf,
    pub original_name: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// What the dispatcher hands the converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub files: Vec<InputFile>,
    pub output_format: TargetFormat,
    pub work_dir: PathBuf,
    pub job_id: String,
}

impl JobDescriptor {
    /// Reject descriptors the converter must not run.
    pub fn validate(&self, config: &ConverterConfig) -> Result<(), BatchError> {
        if self.job_id.is_empty() {
            return Err(BatchError::InvalidJob("jobId is empty".into()));
        }
        if !self
            .job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BatchError::InvalidJob(format!(
                "jobId {:?} may only contain letters, digits, '-' and '_'",
                self.job_id
            )));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(BatchError::InvalidJob("workDir is empty".into()));
        }

        let limits = &config.limits;
        let raw: Vec<&InputFile> = self
            .files
            .iter()
            .filter(|f| classify(&f.original_name) == FormatClass::Raw)
            .collect();
        if raw.len() > limits.max_raw_files {
            return Err(BatchError::InvalidJob(format!(
                "{} RAW files exceed the limit of {}",
                raw.len(),
                limits.max_raw_files
            )));
        }
        if let Some(big) = raw.iter().find(|f| f.size_bytes > limits.max_raw_file_bytes) {
            return Err(BatchError::InvalidJob(format!(
                "{} is {} bytes, over the RAW limit of {} bytes",
                big.original_name, big.size_bytes, limits.max_raw_file_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedFile {
    pub filename: String,
    pub size: u64,
}

/// The single terminal message for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub converted_files: Vec<ConvertedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            converted_files: Vec::new(),
            archive_path: None,
            error: Some(message.into()),
        }
    }
}

/// A finished batch, before it is reduced to a [`JobOutcome`].
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub results: Vec<ConversionResult>,
    pub archive_path: PathBuf,
    pub archive_size: u64,
}

impl From<BatchSummary> for JobOutcome {
    fn from(summary: BatchSummary) -> Self {
        Self {
            success: true,
            converted_files: summary
                .results
                .into_iter()
                .map(|r| ConvertedFile {
                    filename: r.output_name,
                    size: r.size,
                })
                .collect(),
            archive_path: Some(summary.archive_path),
            error: None,
        }
    }
}

/// Progress notifications for a watching front end.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started {
        job_id: String,
        total: usize,
        target: TargetFormat,
    },
    FileFinished {
        index: usize,
        total: usize,
        original_name: String,
        result: ConversionResult,
    },
    Archived {
        path: PathBuf,
        entries: usize,
        size: u64,
    },
}

// ============================================================================
// Running a job
// ============================================================================

/// Everything a job needs besides its descriptor.
pub struct JobContext<R: ToolRunner> {
    pub runner: R,
    pub config: ConverterConfig,
    pub cancel: CancelToken,
    pub events: Option<Sender<BatchEvent>>,
}

impl JobContext<SystemRunner> {
    /// Real tools, sharing one cancel token with the runner.
    pub fn system(config: ConverterConfig) -> Self {
        let cancel = CancelToken::new();
        Self {
            runner: SystemRunner::with_cancel(cancel.clone()),
            config,
            cancel,
            events: None,
        }
    }
}

impl<R: ToolRunner> JobContext<R> {
    pub fn new(runner: R, config: ConverterConfig, cancel: CancelToken) -> Self {
        Self {
            runner,
            config,
            cancel,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<BatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Run a job to completion on the current thread.
pub fn run<R: ToolRunner>(job: &JobDescriptor, ctx: &JobContext<R>) -> Result<BatchSummary, BatchError> {
    job.validate(&ctx.config)?;
    fs::create_dir_all(&job.work_dir).map_err(|source| BatchError::WorkDir {
        path: job.work_dir.clone(),
        source,
    })?;

    let total = job.files.len();
    let progress = ProgressTracker::create(&job.work_dir, &job.job_id, total)?;
    let availability = cached_probe(&ctx.runner, &ctx.config);
    info!(
        job_id = %job.job_id,
        files = total,
        target = %job.output_format,
        tools = %availability,
        "starting conversion job"
    );
    progress.start()?;
    ctx.emit(BatchEvent::Started {
        job_id: job.job_id.clone(),
        total,
        target: job.output_format.clone(),
    });

    let names = output_names(
        job.files.iter().map(|f| f.original_name.as_str()),
        &job.output_format,
    );
    let converter = Converter::new(&ctx.runner, &availability, &ctx.config, &job.work_dir);
    let convert_one = |index: usize, file: &InputFile| -> Result<ConversionResult, BatchError> {
        if ctx.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        let result = converter.process(file, &names[index], &job.output_format, &progress);
        ctx.emit(BatchEvent::FileFinished {
            index,
            total,
            original_name: file.original_name.clone(),
            result: result.clone(),
        });
        Ok(result)
    };

    let results = match ctx.config.processing.mode {
        ProcessingMode::Sequential => job
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| convert_one(i, f))
            .collect::<Result<Vec<_>, _>>()?,
        ProcessingMode::Parallel => {
            let workers = effective_workers(&ctx.config.processing, total);
            let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;
            pool.install(|| {
                job.files
                    .par_iter()
                    .enumerate()
                    .map(|(i, f)| convert_one(i, f))
                    .collect::<Result<Vec<_>, _>>()
            })?
        }
    };
    if ctx.cancel.is_cancelled() {
        return Err(BatchError::Cancelled);
    }

    let archive_path = job.work_dir.join(ARCHIVE_NAME);
    let archive_size = write_archive(&job.work_dir, &names, &archive_path)?;
    ctx.emit(BatchEvent::Archived {
        path: archive_path.clone(),
        entries: names.len(),
        size: archive_size,
    });
    progress.finish()?;

    let placeholders = results.iter().filter(|r| r.is_placeholder()).count();
    info!(
        job_id = %job.job_id,
        files = total,
        placeholders,
        archive = %archive_path.display(),
        "conversion job finished"
    );
    Ok(BatchSummary {
        results,
        archive_path,
        archive_size,
    })
}

/// Run a job and reduce it to its terminal outcome, discarding the work
/// directory on failure.
pub fn run_job<R: ToolRunner>(job: &JobDescriptor, ctx: &JobContext<R>) -> JobOutcome {
    match run(job, ctx) {
        Ok(summary) => summary.into(),
        Err(e) => {
            error!(job_id = %job.job_id, "conversion job failed: {e}");
            discard_work_dir(&job.work_dir);
            JobOutcome::failed(e.to_string())
        }
    }
}

fn discard_work_dir(dir: &Path) {
    if dir.as_os_str().is_empty() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "cannot remove work directory: {e}"),
    }
}

// ============================================================================
// Isolated job thread
// ============================================================================

/// A job running on its own thread.
pub struct JobHandle {
    outcome: mpsc::Receiver<JobOutcome>,
    thread: JoinHandle<()>,
    cancel: CancelToken,
    work_dir: PathBuf,
    timeout: Duration,
}

impl JobHandle {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Wait for the outcome, at most the configured batch timeout.
    pub fn wait(self) -> JobOutcome {
        match self.outcome.recv_timeout(self.timeout) {
            Ok(outcome) => {
                if self.thread.join().is_err() {
                    warn!("job thread panicked after reporting");
                }
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    after_secs = self.timeout.as_secs(),
                    "batch timeout, cancelling running tools"
                );
                self.cancel.cancel();
                let _ = self.thread.join();
                discard_work_dir(&self.work_dir);
                JobOutcome::failed(BatchError::TimedOut.to_string())
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = self.thread.join();
                discard_work_dir(&self.work_dir);
                JobOutcome::failed(BatchError::WorkerPanicked.to_string())
            }
        }
    }
}

/// Run `job` with the real tools on a dedicated thread.
pub fn spawn_job(
    job: JobDescriptor,
    config: ConverterConfig,
    events: Option<Sender<BatchEvent>>,
) -> JobHandle {
    let mut ctx = JobContext::system(config);
    ctx.events = events;
    spawn_job_with(job, ctx)
}

/// Run `job` on a dedicated thread with a caller-supplied context.
pub fn spawn_job_with<R>(job: JobDescriptor, ctx: JobContext<R>) -> JobHandle
where
    R: ToolRunner + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = ctx.cancel.clone();
    let timeout = ctx.config.timeouts.batch();
    let work_dir = job.work_dir.clone();
    let thread = std::thread::spawn(move || {
        let outcome = run_job(&job, &ctx);
        let _ = tx.send(outcome);
    });
    JobHandle {
        outcome: rx,
        thread,
        cancel,
        work_dir,
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::progress::{JobStatus, read_progress};
    use crate::test_helpers::*;
    use tempfile::TempDir;

    fn config() -> ConverterConfig {
        let mut config = ConverterConfig::default();
        config.timeouts.probe_cache_secs = 0;
        config
    }

    fn job(tmp: &TempDir, names: &[&str], target: TargetFormat) -> JobDescriptor {
        let uploads = tmp.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let files = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = uploads.join(format!("{i}-{name}"));
                write_png(&path, 16, 16);
                InputFile {
                    path,
                    original_name: name.to_string(),
                    size_bytes: 1,
                }
            })
            .collect();
        JobDescriptor {
            files,
            output_format: target,
            work_dir: tmp.path().join("job"),
            job_id: "job-1".into(),
        }
    }

    fn ctx(config: ConverterConfig) -> JobContext<ScriptedRunner> {
        JobContext::new(ScriptedRunner::new(), config, CancelToken::new())
    }

    #[test]
    fn descriptor_json_is_camel_case() {
        let json = r#"{
            "files": [{"path": "/tmp/u/1", "originalName": "a.png", "sizeBytes": 10}],
            "outputFormat": "webp",
            "workDir": "/tmp/job",
            "jobId": "abc"
        }"#;
        let job: JobDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(job.output_format, TargetFormat::Webp);
        assert_eq!(job.files[0].original_name, "a.png");
        assert_eq!(job.files[0].size_bytes, 10);
    }

    #[test]
    fn outcome_json_shapes() {
        let ok = JobOutcome {
            success: true,
            converted_files: vec![ConvertedFile {
                filename: "a.webp".into(),
                size: 3,
            }],
            archive_path: Some(PathBuf::from("/j/converted_images.zip")),
            error: None,
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["convertedFiles"][0]["filename"], "a.webp");
        assert_eq!(value["archivePath"], "/j/converted_images.zip");
        assert!(value.get("error").is_none());

        let failed = serde_json::to_value(JobOutcome::failed("boom")).unwrap();
        assert_eq!(failed, serde_json::json!({"success": false, "error": "boom"}));
    }

    #[test]
    fn validation_rejects_bad_ids_and_dirs() {
        let tmp = TempDir::new().unwrap();
        let config = config();
        let mut j = job(&tmp, &[], TargetFormat::Png);
        j.job_id = String::new();
        assert!(matches!(j.validate(&config), Err(BatchError::InvalidJob(_))));
        j.job_id = "../escape".into();
        assert!(matches!(j.validate(&config), Err(BatchError::InvalidJob(_))));
        j.job_id = "ok_id-1".into();
        j.work_dir = PathBuf::new();
        assert!(matches!(j.validate(&config), Err(BatchError::InvalidJob(_))));
    }

    #[test]
    fn validation_enforces_raw_limits() {
        let tmp = TempDir::new().unwrap();
        let mut config = config();
        config.limits.max_raw_files = 2;
        let mut j = job(&tmp, &["a.cr2", "b.nef", "c.arw"], TargetFormat::Jpg);
        assert!(j.validate(&config).is_err());

        j.files.truncate(2);
        assert!(j.validate(&config).is_ok());

        j.files[0].size_bytes = config.limits.max_raw_file_bytes + 1;
        let err = j.validate(&config).unwrap_err();
        assert!(err.to_string().contains("a.cr2"));
    }

    #[test]
    fn non_raw_files_are_not_counted_against_raw_limit() {
        let tmp = TempDir::new().unwrap();
        let mut config = config();
        config.limits.max_raw_files = 1;
        let j = job(&tmp, &["a.png", "b.png", "c.jpg"], TargetFormat::Png);
        assert!(j.validate(&config).is_ok());
    }

    #[test]
    fn sequential_run_archives_every_file() {
        let tmp = TempDir::new().unwrap();
        let j = job(&tmp, &["a.png", "b.png", "a.jpg"], TargetFormat::Png);
        let summary = run(&j, &ctx(config())).unwrap();

        let names: Vec<_> = summary.results.iter().map(|r| r.output_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png", "a (1).png"]);
        assert!(summary.archive_path.exists());
        assert_eq!(summary.archive_size, fs::metadata(&summary.archive_path).unwrap().len());

        let record = read_progress(&j.work_dir).unwrap();
        assert_eq!((record.done, record.total, record.status), (3, 3, JobStatus::Done));
    }

    #[test]
    fn parallel_run_keeps_input_order() {
        let tmp = TempDir::new().unwrap();
        let names = ["1.png", "2.png", "3.png", "4.png", "5.png"];
        let j = job(&tmp, &names, TargetFormat::Webp);
        let mut config = config();
        config.processing = ProcessingConfig {
            mode: ProcessingMode::Parallel,
            max_workers: Some(3),
        };
        let summary = run(&j, &ctx(config)).unwrap();
        let out: Vec<_> = summary.results.iter().map(|r| r.output_name.clone()).collect();
        assert_eq!(out, vec!["1.webp", "2.webp", "3.webp", "4.webp", "5.webp"]);
        assert_eq!(read_progress(&j.work_dir).unwrap().done, 5);
    }

    #[test]
    fn events_mirror_progress() {
        let tmp = TempDir::new().unwrap();
        let j = job(&tmp, &["a.png", "b.png"], TargetFormat::Jpg);
        let (tx, rx) = mpsc::channel();
        run(&j, &ctx(config()).with_events(tx)).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events[0], BatchEvent::Started { total: 2, .. }));
        assert!(matches!(events[1], BatchEvent::FileFinished { index: 0, .. }));
        assert!(matches!(events[2], BatchEvent::FileFinished { index: 1, .. }));
        assert!(matches!(events[3], BatchEvent::Archived { entries: 2, .. }));
    }

    #[test]
    fn cancelled_job_fails_and_discards_work_dir() {
        let tmp = TempDir::new().unwrap();
        let j = job(&tmp, &["a.png"], TargetFormat::Png);
        let ctx = ctx(config());
        ctx.cancel.cancel();
        let outcome = run_job(&j, &ctx);
        assert!(!outcome.success);
        assert!(outcome.archive_path.is_none());
        assert!(!j.work_dir.exists());
    }

    #[test]
    fn invalid_job_fails_without_archive() {
        let tmp = TempDir::new().unwrap();
        let mut j = job(&tmp, &["a.png"], TargetFormat::Png);
        j.job_id = "bad id".into();
        let outcome = run_job(&j, &ctx(config()));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("invalid job"));
    }

    #[test]
    fn spawned_job_reports_outcome() {
        let tmp = TempDir::new().unwrap();
        let j = job(&tmp, &["a.png"], TargetFormat::Tiff);
        let outcome = spawn_job_with(j, ctx(config())).wait();
        assert!(outcome.success);
        assert_eq!(outcome.converted_files[0].filename, "a.tiff");
    }
}
