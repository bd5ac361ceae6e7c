use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RetentionPolicy;
use crate::error::StoreError;
use crate::job::{AttemptOutcome, DeliveryAttempt, Job, JobId, JobState};

use super::{JobStore, Result, StateChange};

/// In-process [`JobStore`] backing.
///
/// One mutex guards the whole map, which trivially serializes `transition`
/// per job id; contention is acceptable for an embedded engine and the
/// contract stays identical to what a SQL backend provides with a
/// compare-and-swap `UPDATE ... WHERE state = ?`.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    attempts: HashMap<String, Vec<DeliveryAttempt>>,
    /// Insertion order, for stable listing and due-time tie-breaks
    seq: HashMap<String, u64>,
    next_seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(job: &mut Job, change: &StateChange) {
    job.state = change.target_state();
    match change {
        StateChange::Claim { at } => {
            job.attempts_made += 1;
            job.last_heartbeat = Some(*at);
        }
        StateChange::Promote => {}
        StateChange::Complete { at } => {
            job.finished_at = Some(*at);
            job.last_heartbeat = None;
        }
        StateChange::RetryAt { at, error } => {
            job.next_run_at = *at;
            job.last_error = Some(error.clone());
            job.last_heartbeat = None;
        }
        StateChange::Fail { at, error } => {
            job.finished_at = Some(*at);
            job.last_error = Some(error.clone());
            job.last_heartbeat = None;
        }
        StateChange::Reclaim => {
            job.last_heartbeat = None;
        }
        StateChange::Requeue { at } => {
            job.attempts_made = 0;
            job.next_run_at = *at;
            job.last_error = None;
            job.finished_at = None;
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        let mut inner = self.lock();
        let id = job.id.clone();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(id.0.clone(), seq);
        inner.jobs.insert(id.0.clone(), job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id.0).cloned())
    }

    async fn transition(&self, id: &JobId, change: StateChange) -> Result<Job> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let expected = change.expected_state();
        if job.state != expected {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected,
                actual: job.state,
            });
        }

        apply(job, &change);
        Ok(job.clone())
    }

    async fn list_by_state(&self, queue: &str, state: JobState) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.queue_name == queue && j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, inner.seq.get(&j.id.0).copied().unwrap_or(0)));
        Ok(jobs)
    }

    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.queue_name == queue && j.state == state)
            .count() as u64)
    }

    async fn delete(&self, id: &JobId) -> Result<()> {
        let mut inner = self.lock();
        inner.jobs.remove(&id.0);
        inner.attempts.remove(&id.0);
        inner.seq.remove(&id.0);
        Ok(())
    }

    async fn append_attempt(&self, attempt: DeliveryAttempt) -> Result<()> {
        let mut inner = self.lock();
        inner
            .attempts
            .entry(attempt.job_id.0.clone())
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn resolve_attempt(
        &self,
        job_id: &JobId,
        attempt_number: u32,
        status_code: Option<u16>,
        duration_ms: u64,
        response_snippet: Option<String>,
        outcome: AttemptOutcome,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(rows) = inner.attempts.get_mut(&job_id.0) {
            if let Some(row) = rows
                .iter_mut()
                .find(|a| a.attempt_number == attempt_number && a.outcome == AttemptOutcome::Pending)
            {
                row.status_code = status_code;
                row.duration_ms = duration_ms;
                row.response_snippet = response_snippet;
                row.outcome = outcome;
            }
        }
        Ok(())
    }

    async fn attempts(&self, id: &JobId) -> Result<Vec<DeliveryAttempt>> {
        let mut rows = self.lock().attempts.get(&id.0).cloned().unwrap_or_default();
        rows.sort_by_key(|a| a.attempt_number);
        Ok(rows)
    }

    async fn heartbeat(&self, id: &JobId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id.0) {
            if job.state == JobState::Active {
                job.last_heartbeat = Some(at);
            }
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut inner = self.lock();
        let mut reclaimed = Vec::new();

        for job in inner.jobs.values_mut() {
            if job.queue_name != queue || job.state != JobState::Active {
                continue;
            }
            let seen = job.last_heartbeat.unwrap_or(job.created_at);
            if seen >= older_than {
                continue;
            }

            // The crashed attempt was already counted at claim time.
            if job.attempts_made >= job.max_attempts {
                job.state = JobState::Failed;
                job.last_error = Some("stale ownership: worker presumed dead".to_string());
                job.finished_at = Some(now);
            } else {
                job.state = JobState::Waiting;
                job.next_run_at = now;
            }
            job.last_heartbeat = None;
            reclaimed.push(job.clone());
        }

        Ok(reclaimed)
    }

    async fn purge_terminal(
        &self,
        queue: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock();

        let mut terminal: Vec<(String, DateTime<Utc>)> = inner
            .jobs
            .values()
            .filter(|j| j.queue_name == queue && j.state.is_terminal())
            .map(|j| (j.id.0.clone(), j.finished_at.unwrap_or(j.created_at)))
            .collect();
        // newest first; purge from the tail
        terminal.sort_by(|a, b| b.1.cmp(&a.1));

        let mut doomed: Vec<String> = Vec::new();

        if let Some(age) = policy.max_age.and_then(|d| chrono::Duration::from_std(d).ok()) {
            let cutoff = now - age;
            terminal.retain(|(id, finished)| {
                if *finished < cutoff {
                    doomed.push(id.clone());
                    false
                } else {
                    true
                }
            });
        }

        if let Some(max_count) = policy.max_count {
            for (id, _) in terminal.iter().skip(max_count) {
                doomed.push(id.clone());
            }
        }

        let purged = doomed.len() as u64;
        for id in doomed {
            inner.jobs.remove(&id);
            inner.attempts.remove(&id);
            inner.seq.remove(&id);
        }
        Ok(purged)
    }
}
