//! Transcode worker pool
//!
//! Jobs are spawned onto the runtime captured at construction and tracked by a
//! `TaskTracker` so shutdown can wait for them. A semaphore bounds how many
//! encoders run at once. Every job ends with exactly one `TranscodeReport` on
//! the report channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::{Encoder, TranscodeError, TranscodeJob};
use crate::settings::AppSettings;

/// Finished job statuses kept for lookup
const MAX_FINISHED_JOBS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Deadline for one encoder run
    pub timeout: Duration,
    pub max_concurrent: usize,
}

impl QueueConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            timeout: settings.encoder_timeout(),
            max_concurrent: settings.max_concurrent_transcodes.max(1),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed(_))
    }
}

/// Job statuses: every unfinished job plus the most recent finished ones.
#[derive(Default)]
struct JobBook {
    statuses: HashMap<Uuid, JobStatus>,
    finished: VecDeque<Uuid>,
}

impl JobBook {
    fn set(&mut self, id: Uuid, status: JobStatus) {
        let finished = status.is_finished();
        if self.statuses.insert(id, status).is_some_and(|old| old.is_finished()) {
            self.finished.retain(|done| *done != id);
        }
        if finished {
            self.finished.push_back(id);
            while self.finished.len() > MAX_FINISHED_JOBS {
                if let Some(oldest) = self.finished.pop_front() {
                    self.statuses.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, id: &Uuid) -> Option<&JobStatus> {
        self.statuses.get(id)
    }

    fn iter(&self) -> impl Iterator<Item = (&Uuid, &JobStatus)> {
        self.statuses.iter()
    }
}

/// A job whose encoded file is in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSuccess {
    /// Set when the raw file could not be removed afterwards
    pub cleanup_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeReport {
    pub job: TranscodeJob,
    pub elapsed: Duration,
    pub result: Result<TranscodeSuccess, TranscodeError>,
}

struct QueueInner {
    encoder: Arc<dyn Encoder>,
    config: QueueConfig,
    permits: Semaphore,
    jobs: Mutex<JobBook>,
    /// Target paths of jobs not yet finished
    in_flight: Mutex<HashSet<PathBuf>>,
    reports: mpsc::UnboundedSender<TranscodeReport>,
}

impl QueueInner {
    fn jobs(&self) -> MutexGuard<'_, JobBook> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, id: Uuid, status: JobStatus) {
        self.jobs().set(id, status);
    }
}

pub struct TranscodeQueue {
    inner: Arc<QueueInner>,
    tracker: TaskTracker,
    runtime: Handle,
}

impl TranscodeQueue {
    /// Create a queue bound to the current tokio runtime.
    ///
    /// # Panics
    /// When called outside a runtime.
    pub fn new(
        encoder: Arc<dyn Encoder>,
        config: QueueConfig,
        reports: mpsc::UnboundedSender<TranscodeReport>,
    ) -> Self {
        Self::with_handle(encoder, config, reports, Handle::current())
    }

    pub fn with_handle(
        encoder: Arc<dyn Encoder>,
        config: QueueConfig,
        reports: mpsc::UnboundedSender<TranscodeReport>,
        runtime: Handle,
    ) -> Self {
        log::info!(
            "Transcode queue ready: encoder {:?}, timeout {:?}, {} concurrent",
            encoder.name(),
            config.timeout,
            config.max_concurrent
        );

        Self {
            inner: Arc::new(QueueInner {
                encoder,
                permits: Semaphore::new(config.max_concurrent.max(1)),
                config,
                jobs: Mutex::new(JobBook::default()),
                in_flight: Mutex::new(HashSet::new()),
                reports,
            }),
            tracker: TaskTracker::new(),
            runtime,
        }
    }

    /// Take ownership of the job's raw file and schedule conversion.
    ///
    /// Safe to call from blocking threads. Fails only when a job for the same
    /// target is still in flight; the raw file is left untouched then.
    pub fn enqueue(&self, job: TranscodeJob) -> Result<(), TranscodeError> {
        if !self.inner.in_flight().insert(job.target_path.clone()) {
            log::warn!("Rejecting duplicate transcode for {:?}", job.target_path);
            return Err(TranscodeError::DuplicateTarget(job.target_path));
        }

        self.inner.set_status(job.id, JobStatus::Pending);
        log::info!(
            "Queued transcode {} for {:?} ({} kbps)",
            job.id,
            job.label,
            job.bitrate_kbps
        );

        let inner = self.inner.clone();
        self.tracker.spawn_on(process_job(inner, job), &self.runtime);
        Ok(())
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.inner.jobs().get(&id).cloned()
    }

    pub fn statuses(&self) -> Vec<(Uuid, JobStatus)> {
        self.inner
            .jobs()
            .iter()
            .map(|(id, status)| (*id, status.clone()))
            .collect()
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.inner.in_flight().len()
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.config
    }

    /// Wait for every job enqueued so far to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        log::info!("Waiting for {} transcode job(s)", self.tracker.len());
        self.tracker.wait().await;
        log::info!("Transcode queue drained");
    }
}

async fn process_job(inner: Arc<QueueInner>, job: TranscodeJob) {
    let result = match inner.permits.acquire().await {
        Ok(_permit) => {
            inner.set_status(job.id, JobStatus::Running);
            let started = Instant::now();
            log::info!("Transcoding {:?} -> {:?}", job.raw_path, job.target_path);

            let result = run_job(inner.encoder.as_ref(), &job, inner.config.timeout).await;
            (started.elapsed(), result)
        }
        Err(e) => (
            Duration::ZERO,
            Err(TranscodeError::SpawnFailed(format!("queue closed: {}", e))),
        ),
    };
    let (elapsed, result) = result;

    match &result {
        Ok(success) => {
            log::info!(
                "Transcode {} finished in {:.1}s: {:?}",
                job.id,
                elapsed.as_secs_f64(),
                job.target_path
            );
            if let Some(e) = &success.cleanup_error {
                log::warn!("Could not remove raw file {:?}: {}", job.raw_path, e);
            }
            inner.set_status(job.id, JobStatus::Succeeded);
        }
        Err(e) => {
            log::error!("Transcode {} failed: {} (raw kept at {:?})", job.id, e, job.raw_path);
            inner.set_status(job.id, JobStatus::Failed(e.to_string()));
        }
    }

    inner.in_flight().remove(&job.target_path);
    let report = TranscodeReport {
        job,
        elapsed,
        result,
    };
    if inner.reports.send(report).is_err() {
        log::debug!("No listener for transcode reports");
    }
}

async fn run_job(
    encoder: &dyn Encoder,
    job: &TranscodeJob,
    limit: Duration,
) -> Result<TranscodeSuccess, TranscodeError> {
    if let Err(e) = run_encoder(encoder, job, limit).await {
        remove_partial_output(&job.target_path).await;
        return Err(e);
    }

    let cleanup_error = tokio::fs::remove_file(&job.raw_path)
        .await
        .err()
        .map(|e| e.to_string());
    Ok(TranscodeSuccess { cleanup_error })
}

async fn run_encoder(
    encoder: &dyn Encoder,
    job: &TranscodeJob,
    limit: Duration,
) -> Result<(), TranscodeError> {
    let mut command = encoder.command(job);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| TranscodeError::SpawnFailed(format!("{}: {}", encoder.name(), e)))?;

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) if status.success() => {}
        Ok(Ok(status)) => {
            return Err(TranscodeError::EncoderFailed(format!(
                "{} exited with {}",
                encoder.name(),
                status
            )))
        }
        Ok(Err(e)) => return Err(TranscodeError::EncoderFailed(e.to_string())),
        Err(_) => {
            log::warn!("Encoder for {:?} timed out, killing it", job.raw_path);
            if let Err(e) = child.kill().await {
                log::error!("Failed to kill encoder: {}", e);
            }
            return Err(TranscodeError::Timeout(limit));
        }
    }

    match tokio::fs::metadata(&job.target_path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(TranscodeError::OutputMissing(job.target_path.clone())),
    }
}

async fn remove_partial_output(target: &Path) {
    match tokio::fs::remove_file(target).await {
        Ok(()) => log::debug!("Removed partial output {:?}", target),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove partial output {:?}: {}", target, e),
    }
}
