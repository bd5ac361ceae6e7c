pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RetentionPolicy;
use crate::error::StoreError;
use crate::job::{AttemptOutcome, DeliveryAttempt, Job, JobId, JobState};

pub use memory::MemoryStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// State transition applied through [`JobStore::transition`].
///
/// Each variant encodes the target state plus the field mutations that go
/// with it, so the compare-and-swap and the mutation land in one atomic step.
#[derive(Debug, Clone)]
pub enum StateChange {
    /// `waiting -> active`; increments `attempts_made` and stamps the first
    /// heartbeat. Beginning an attempt is what consumes it, so a claim that
    /// later crashes still counts against the ceiling.
    Claim { at: DateTime<Utc> },
    /// `delayed -> waiting`, once the job is due
    Promote,
    /// `active -> completed`
    Complete { at: DateTime<Utc> },
    /// `active -> delayed`, to be retried at `at`
    RetryAt { at: DateTime<Utc>, error: String },
    /// `active -> failed`, terminally
    Fail { at: DateTime<Utc>, error: String },
    /// `active -> waiting` after stale-ownership reclaim. No error string is
    /// recorded; the owning worker died without reporting one.
    Reclaim,
    /// `failed -> waiting`, manual re-enqueue; resets `attempts_made`
    Requeue { at: DateTime<Utc> },
}

impl StateChange {
    /// The state the job must currently be in for this change to apply.
    pub fn expected_state(&self) -> JobState {
        match self {
            StateChange::Claim { .. } => JobState::Waiting,
            StateChange::Promote => JobState::Delayed,
            StateChange::Complete { .. }
            | StateChange::RetryAt { .. }
            | StateChange::Fail { .. }
            | StateChange::Reclaim => JobState::Active,
            StateChange::Requeue { .. } => JobState::Failed,
        }
    }

    /// The state the job ends up in.
    pub fn target_state(&self) -> JobState {
        match self {
            StateChange::Claim { .. } => JobState::Active,
            StateChange::Promote | StateChange::Reclaim | StateChange::Requeue { .. } => {
                JobState::Waiting
            }
            StateChange::Complete { .. } => JobState::Completed,
            StateChange::RetryAt { .. } => JobState::Delayed,
            StateChange::Fail { .. } => JobState::Failed,
        }
    }
}

/// Durable mapping from job id to job record.
///
/// `transition` is the sole mutation entrypoint for job state and must be
/// atomic per job id (compare-and-swap on the expected state); this is what
/// guarantees at most one active execution per job under concurrent
/// dispatchers. Different job ids may be mutated fully concurrently.
///
/// The crate ships [`MemoryStore`]; any backend honoring this contract can be
/// plugged in instead.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Atomically apply `change` if the job is currently in
    /// `change.expected_state()`, returning the updated record. Fails with
    /// [`StoreError::Conflict`] when another worker got there first.
    async fn transition(&self, id: &JobId, change: StateChange) -> Result<Job>;

    /// Jobs in `state` for `queue`, ordered by creation
    async fn list_by_state(&self, queue: &str, state: JobState) -> Result<Vec<Job>>;

    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<u64>;

    async fn delete(&self, id: &JobId) -> Result<()>;

    /// Append an attempt row; rows are never mutated afterwards except by
    /// `resolve_attempt`.
    async fn append_attempt(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Resolve a pending attempt row with its final outcome.
    async fn resolve_attempt(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        status_code: Option<u16>,
        duration_ms: u64,
        response_snippet: Option<String>,
        outcome: AttemptOutcome,
    ) -> Result<()>;

    /// All attempt rows for a job, in attempt order
    async fn attempts(&self, id: &JobId) -> Result<Vec<DeliveryAttempt>>;

    /// Stamp liveness on an active job. A no-op if the job is no longer
    /// active (the heartbeat lost a race with completion).
    async fn heartbeat(&self, id: &JobId, at: DateTime<Utc>) -> Result<()>;

    /// Return orphaned `active` jobs (heartbeat older than `older_than`) to
    /// `waiting`, or to `failed` for jobs already at their attempt ceiling.
    /// Returns the updated records.
    async fn reclaim_stale(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>>;

    /// Purge terminal jobs beyond the retention policy. Returns how many
    /// were removed.
    async fn purge_terminal(
        &self,
        queue: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}
