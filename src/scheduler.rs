use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::job::{Job, JobId, Recurrence};

/// Heap entry; ordered by due time, insertion order breaking ties.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    due: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered ready queue, one min-heap per queue name.
///
/// Entries are pushed at enqueue/reschedule time and popped when due. An
/// entry may be stale by the time it pops (the job was claimed elsewhere,
/// deleted, or manually requeued); the dispatcher's compare-and-swap claim is
/// what decides, so stale pops are harmless.
pub struct Scheduler {
    heaps: Mutex<HashMap<String, BinaryHeap<Reverse<ReadyEntry>>>>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            heaps: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Track a job at its `next_run_at`.
    pub fn schedule(&self, job: &Job) {
        let entry = ReadyEntry {
            due: job.next_run_at,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            id: job.id.clone(),
        };
        let mut heaps = self.heaps.lock().unwrap_or_else(|e| e.into_inner());
        heaps
            .entry(job.queue_name.clone())
            .or_default()
            .push(Reverse(entry));
    }

    /// Re-track a job after its `next_run_at` moved (retry backoff).
    pub fn reschedule(&self, job: &Job) {
        self.schedule(job);
    }

    /// Pop the earliest job due at or before `now`, or None if the earliest
    /// entry is still in the future.
    pub fn next_ready(&self, queue: &str, now: DateTime<Utc>) -> Option<JobId> {
        let mut heaps = self.heaps.lock().unwrap_or_else(|e| e.into_inner());
        let heap = heaps.get_mut(queue)?;
        match heap.peek() {
            Some(Reverse(entry)) if entry.due <= now => heap.pop().map(|Reverse(e)| e.id),
            _ => None,
        }
    }

    /// Earliest due time across pending entries, as a sleep hint for the
    /// dispatch loop.
    pub fn next_wakeup(&self, queue: &str) -> Option<DateTime<Utc>> {
        let heaps = self.heaps.lock().unwrap_or_else(|e| e.into_inner());
        heaps
            .get(queue)
            .and_then(|heap| heap.peek())
            .map(|Reverse(entry)| entry.due)
    }

    /// Next occurrence of a recurrence rule, computed from `now`.
    ///
    /// Computing from `now` rather than from the previously scheduled time is
    /// what bounds catch-up to a single run after downtime: occurrences
    /// missed while the engine was offline collapse into the one next
    /// occurrence.
    pub fn next_occurrence(
        recurrence: &Recurrence,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, String> {
        match recurrence {
            Recurrence::Every(interval) => {
                let step = chrono::Duration::from_std(*interval)
                    .map_err(|e| format!("Interval out of range: {}", e))?;
                Ok(now + step)
            }
            Recurrence::Cron(expr) => {
                let schedule = Schedule::from_str(expr)
                    .map_err(|e| format!("Invalid cron expression: {}", e))?;
                schedule
                    .after(&now)
                    .next()
                    .ok_or_else(|| "No upcoming occurrence".to_string())
            }
        }
    }

    /// Validate a cron expression without scheduling anything.
    pub fn validate_cron(expr: &str) -> Result<(), String> {
        Schedule::from_str(expr)
            .map(|_| ())
            .map_err(|e| format!("Invalid cron expression: {}", e))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
