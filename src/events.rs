use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::job::{JobId, JobState};

/// A state transition, published once per [`JobStore::transition`]
/// success.
///
/// [`JobStore::transition`]: crate::store::JobStore::transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub queue_name: String,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    /// Failure reason for retry/fail transitions
    pub reason: Option<String>,
}

/// Handle returned by [`EventBus::subscribe`]; dropping it (or calling
/// [`EventBus::unsubscribe`]) stops delivery.
pub struct Subscription {
    pub id: u64,
    pub receiver: UnboundedReceiver<JobEvent>,
}

/// Observer hook for job state transitions.
///
/// Events for a given job are published in the order its transitions
/// occurred: the dispatcher publishes immediately after each successful
/// compare-and-swap, and a job has at most one owner at a time, so per-job
/// order on every subscriber channel matches transition order. No ordering is
/// guaranteed across different jobs.
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, UnboundedSender<JobEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Deliver to all live subscribers, dropping any whose receiver is gone.
    pub fn publish(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
