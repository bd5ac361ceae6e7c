use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Whether the job has reached the end of its lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule for re-enqueuing a job after each successful run.
///
/// `Cron` expressions are evaluated in UTC. If the engine was offline past one
/// or more scheduled occurrences, the next occurrence is computed from the
/// current time, so at most one catch-up run is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recurrence {
    /// Fixed interval between runs
    Every(Duration),
    /// Calendar-based cron expression, e.g. `"0 0 3 * * *"`
    Cron(String),
}

/// A unit of work tracked through the `waiting|delayed -> active ->
/// completed|failed` lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Executor kind this job is dispatched to, e.g. `"webhook"`
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Number of execution attempts begun so far; incremented when the job is
    /// claimed, so a crashed attempt still counts against `max_attempts`.
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// When the job becomes eligible for dispatch
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the job reaches `Completed` or `Failed`
    pub finished_at: Option<DateTime<Utc>>,
    /// Updated periodically while the job is `Active`; drives stale-ownership
    /// reclaim after a crash
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
}

impl Job {
    pub fn new<Q, K>(queue_name: Q, kind: K, payload: serde_json::Value, now: DateTime<Utc>) -> Self
    where
        Q: Into<String>,
        K: Into<String>,
    {
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            kind: kind.into(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 3,
            next_run_at: now,
            last_error: None,
            created_at: now,
            finished_at: None,
            last_heartbeat: None,
            recurrence: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Hold the job back until `run_at`
    pub fn delayed_until(mut self, run_at: DateTime<Utc>) -> Self {
        self.state = JobState::Delayed;
        self.next_run_at = run_at;
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    /// Whether the job is eligible for dispatch at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.next_run_at <= now
    }
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Recorded before the request is made; still `Pending` after a crash
    /// mid-request, which keeps partial failures attributable
    Pending,
    Success,
    Failure,
}

/// Immutable audit record of one execution attempt of a webhook job.
///
/// A `Pending` row is appended before the HTTP call and resolved to
/// `Success`/`Failure` afterwards; rows are never mutated beyond that
/// resolution and never deleted while the job is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub job_id: JobId,
    /// 1-based, equals `attempts_made` at the time of the attempt
    pub attempt_number: u32,
    pub url: String,
    /// None if the transport failed before a response arrived
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    /// Truncated to the configured snippet limit
    pub response_snippet: Option<String>,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
}
