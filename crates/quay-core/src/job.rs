//! Job records and the options that shape them.
//!
//! Jobs are owned by the engine. This crate only passes them through: the
//! payload, id, name, return value, timestamps and state are read access.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A job as stored by the queue engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub opts: JobOptions,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts_made: u32,
    #[serde(default)]
    pub processed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    pub state: JobState,
    /// Key of the repeatable definition that materialized this job
    #[serde(default)]
    pub repeat_key: Option<String>,
    /// Earliest time the job may run (delayed jobs only)
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: String, name: String, data: serde_json::Value, opts: JobOptions) -> Self {
        Self {
            id,
            name,
            data,
            opts,
            timestamp: Utc::now(),
            attempts_made: 0,
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
            state: JobState::Waiting,
            repeat_key: None,
            run_at: None,
        }
    }

    /// Deserialize the payload into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| QueueError::InvalidPayload(format!("job {}: {}", self.id, e)))
    }

    /// Deserialize the return value, if the job has completed with one
    pub fn return_value_as<R: DeserializeOwned>(&self) -> Result<Option<R>> {
        match &self.return_value {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| QueueError::InvalidPayload(format!("job {} result: {}", self.id, e))),
            None => Ok(None),
        }
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts.max(1)
    }
}

/// The state a job is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status filter accepted by `get_jobs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Completed,
    Delayed,
    Failed,
    Waiting,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Delayed,
        JobStatus::Failed,
        JobStatus::Waiting,
    ];

    pub fn as_str(&self) -> &'static str {
        self.state().as_str()
    }

    /// The job state this filter selects
    pub fn state(&self) -> JobState {
        match self {
            Self::Active => JobState::Active,
            Self::Completed => JobState::Completed,
            Self::Delayed => JobState::Delayed,
            Self::Failed => JobState::Failed,
            Self::Waiting => JobState::Waiting,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "delayed" => Ok(Self::Delayed),
            "failed" => Ok(Self::Failed),
            "waiting" => Ok(Self::Waiting),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<&str> for JobStatus {
    type Error = QueueError;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<String> for JobStatus {
    type Error = QueueError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Engine-native job options, passed through verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Custom job id. Adding a job whose id already exists returns the existing job.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Delay in milliseconds before the job becomes waiting
    #[serde(default)]
    pub delay: Option<u64>,
    /// Total number of attempts, including the first one
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Fixed delay in milliseconds between attempts
    #[serde(default)]
    pub backoff: Option<u64>,
    /// Lower numbers run first; 0 means no priority
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub repeat: Option<RepeatOptions>,
    #[serde(default)]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: None,
            attempts: default_attempts(),
            backoff: None,
            priority: 0,
            repeat: None,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(saturating_millis(delay));
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: std::time::Duration) -> Self {
        self.backoff = Some(saturating_millis(backoff));
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self
    }

    /// Reject delays and backoffs that cannot be scheduled from now
    pub fn validate(&self) -> Result<()> {
        let now = Utc::now();
        for (field, ms) in [("delay", self.delay), ("backoff", self.backoff)] {
            if let Some(ms) = ms {
                millis_after(now, ms).ok_or_else(|| {
                    QueueError::InvalidOptions(format!("{} of {} ms is out of range", field, ms))
                })?;
            }
        }
        Ok(())
    }

    /// When a job added at `now` becomes waiting; `None` without a delay
    pub(crate) fn delayed_until(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self.delay.filter(|ms| *ms > 0) {
            Some(ms) => millis_after(now, ms).map(Some).ok_or_else(|| {
                QueueError::InvalidOptions(format!("delay of {} ms is out of range", ms))
            }),
            None => Ok(None),
        }
    }

    /// When a failed job is retried; `None` retries at once.
    ///
    /// Saturates instead of failing since the backoff was validated on add.
    pub(crate) fn retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.backoff
            .filter(|ms| *ms > 0)
            .map(|ms| millis_after(now, ms).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

fn default_attempts() -> u32 {
    1
}

fn saturating_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `now` plus `ms` milliseconds, or `None` past the representable range
fn millis_after(now: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(ms).ok()?;
    now.checked_add_signed(chrono::Duration::try_milliseconds(ms)?)
}

/// Repeat schedule of a repeatable job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron expression with 5 (minute precision) or 6 (second precision) fields
    pub pattern: String,
    /// Stop after this many materialized jobs
    #[serde(default)]
    pub limit: Option<u32>,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One entry of an `add_bulk` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkJob {
    pub data: serde_json::Value,
    #[serde(default)]
    pub opts: Option<JobOptions>,
}

impl BulkJob {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, opts: None }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = Some(opts);
        self
    }
}

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Job lifecycle notification published on a queue's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    Added { queue: String, job_id: String, name: String },
    Waiting { queue: String, job_id: String },
    Delayed { queue: String, job_id: String, run_at: DateTime<Utc> },
    Active { queue: String, job_id: String },
    Completed { queue: String, job_id: String, return_value: serde_json::Value },
    Failed { queue: String, job_id: String, reason: String },
    Removed { queue: String, job_id: String },
    Paused { queue: String },
    Resumed { queue: String },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            Self::Added { queue, .. }
            | Self::Waiting { queue, .. }
            | Self::Delayed { queue, .. }
            | Self::Active { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Removed { queue, .. }
            | Self::Paused { queue }
            | Self::Resumed { queue } => queue,
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Added { job_id, .. }
            | Self::Waiting { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Removed { job_id, .. } => Some(job_id),
            Self::Paused { .. } | Self::Resumed { .. } => None,
        }
    }
}
