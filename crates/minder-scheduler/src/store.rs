//! File-backed job store.
//!
//! One JSON document (`{"jobs": [...]}`) holding the whole collection;
//! every mutation is read-file, modify, write-tmp, rename. Operations are
//! serialized by an in-process mutex plus an advisory file lock so that a
//! CLI invocation and a running server can share the same files.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use minder_types::{parse_duration, DurationError, Job, JobError, JobMode};

use crate::cron::{next_cron, CronError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] JobError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("job not found: {0}")]
    NotFound(String),
}

/// Errors from computing a job's next occurrence.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid runAt: {0}")]
    InvalidRunAt(chrono::ParseError),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("invalid interval: {0}")]
    InvalidInterval(#[from] DurationError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Serialize, Deserialize)]
struct FilePayload {
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Durable collection of jobs backed by a single JSON file.
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    mu: Mutex<()>,
}

impl JobStore {
    /// Open the store, creating parent directories and an empty job file
    /// if none exists yet.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = sibling(&path, ".lock");
        let store = Self {
            path,
            lock_path,
            mu: Mutex::new(()),
        };
        if !store.path.exists() {
            let _guard = store.mu.lock().unwrap();
            let _flock = store.file_lock()?;
            store.save_locked(&FilePayload { jobs: Vec::new() })?;
        }
        debug!("Job store opened: {}", store.path.display());
        Ok(store)
    }

    /// Snapshot of all jobs, ordered by id.
    pub fn list(&self) -> Result<Vec<Job>> {
        let _guard = self.mu.lock().unwrap();
        let _flock = self.file_lock()?;
        let mut jobs = self.load_locked()?.jobs;
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    /// Create or update a job. An existing id keeps its `created_at`;
    /// `next_run_at` is recomputed for the job's mode. Validation or
    /// schedule-computation failure leaves the store unmodified.
    pub fn upsert(&self, mut job: Job, now: DateTime<Utc>, default_tz: &str) -> Result<Job> {
        let _guard = self.mu.lock().unwrap();
        let _flock = self.file_lock()?;

        if job.timezone.trim().is_empty() {
            job.timezone = default_tz.to_string();
        }
        job.validate()?;

        let mut payload = self.load_locked()?;
        let existing = payload.jobs.iter().position(|j| j.id == job.id);
        if let Some(idx) = existing {
            job.created_at = payload.jobs[idx].created_at.clone();
        }
        if job.created_at.is_empty() {
            job.created_at = fmt_rfc3339(now);
        }
        job.updated_at = fmt_rfc3339(now);

        let next = compute_next_run(&job, now)?;
        job.next_run_at = fmt_rfc3339(next);

        match existing {
            Some(idx) => payload.jobs[idx] = job.clone(),
            None => payload.jobs.push(job.clone()),
        }
        self.save_locked(&payload)?;
        debug!(job_id = %job.id, next_run_at = %job.next_run_at, "Job upserted");
        Ok(job)
    }

    /// Remove a job by id. Idempotent: `Ok(false)` when the id is absent.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.mu.lock().unwrap();
        let _flock = self.file_lock()?;
        let mut payload = self.load_locked()?;
        let before = payload.jobs.len();
        payload.jobs.retain(|j| j.id != id);
        if payload.jobs.len() == before {
            return Ok(false);
        }
        self.save_locked(&payload)?;
        debug!(job_id = %id, "Job removed");
        Ok(true)
    }

    /// Enabled jobs whose next occurrence is at or before `now`. A job
    /// with an unparseable `next_run_at` is skipped rather than failing
    /// the whole scan.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let _guard = self.mu.lock().unwrap();
        let _flock = self.file_lock()?;
        let payload = self.load_locked()?;
        let mut due = Vec::new();
        for job in payload.jobs {
            if !job.enabled || job.next_run_at.is_empty() {
                continue;
            }
            let Ok(next) = parse_rfc3339(&job.next_run_at) else {
                continue;
            };
            if next <= now {
                due.push(job);
            }
        }
        Ok(due)
    }

    /// Record an execution and advance the job past `run_at`. A `once` job
    /// is disabled afterwards; a recomputation failure force-disables the
    /// job and overwrites `last_result` so the scheduling error stays
    /// visible even when the trigger itself succeeded.
    pub fn mark_executed(&self, id: &str, run_at: DateTime<Utc>, result: &str) -> Result<()> {
        let _guard = self.mu.lock().unwrap();
        let _flock = self.file_lock()?;
        let mut payload = self.load_locked()?;
        let Some(job) = payload.jobs.iter_mut().find(|j| j.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        job.last_run_at = fmt_rfc3339(run_at);
        job.last_result = result.to_string();
        job.updated_at = fmt_rfc3339(Utc::now());
        match compute_next_run_after(job, run_at) {
            Ok(Some(next)) => job.next_run_at = fmt_rfc3339(next),
            Ok(None) => {
                job.enabled = false;
                job.next_run_at.clear();
            }
            Err(err) => {
                job.enabled = false;
                job.next_run_at.clear();
                job.last_result = format!("error: {err}");
            }
        }
        self.save_locked(&payload)
    }

    fn file_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        // Released when the handle is dropped at the end of the operation.
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load_locked(&self) -> Result<FilePayload> {
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(FilePayload { jobs: Vec::new() });
        }
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_locked(&self, payload: &FilePayload) -> Result<()> {
        let data = serde_json::to_vec_pretty(payload)?;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Next occurrence for a job anchored at `from` (upsert path).
fn compute_next_run(
    job: &Job,
    from: DateTime<Utc>,
) -> std::result::Result<DateTime<Utc>, ScheduleError> {
    match job.mode {
        JobMode::Once => parse_rfc3339(&job.run_at).map_err(ScheduleError::InvalidRunAt),
        JobMode::Cron => {
            let tz = resolve_timezone(&job.timezone)?;
            Ok(next_cron(&job.cron_expr, from, tz)?)
        }
        JobMode::Interval => {
            let d = parse_duration(&job.interval)?;
            Ok(from + d)
        }
    }
}

/// Next occurrence strictly after an execution at `run_at`. `None` means
/// the job has no further occurrence (terminal for `once`).
fn compute_next_run_after(
    job: &Job,
    run_at: DateTime<Utc>,
) -> std::result::Result<Option<DateTime<Utc>>, ScheduleError> {
    match job.mode {
        JobMode::Once => Ok(None),
        JobMode::Cron | JobMode::Interval => compute_next_run(job, run_at).map(Some),
    }
}

fn resolve_timezone(name: &str) -> std::result::Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

pub(crate) fn fmt_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_rfc3339(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc))
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
