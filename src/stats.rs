use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::job::JobState;
use crate::store::JobStore;

/// Per-queue state counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Health report across all configured queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub healthy: bool,
    pub issues: Vec<String>,
}

/// Pure read side over [`JobStore`] counts; holds no state of its own.
pub struct StatsAggregator {
    store: Arc<dyn JobStore>,
    queues: Vec<QueueConfig>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn JobStore>, queues: Vec<QueueConfig>) -> Self {
        Self { store, queues }
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        Ok(QueueStats {
            waiting: self.store.count_by_state(queue, JobState::Waiting).await?,
            delayed: self.store.count_by_state(queue, JobState::Delayed).await?,
            active: self.store.count_by_state(queue, JobState::Active).await?,
            completed: self.store.count_by_state(queue, JobState::Completed).await?,
            failed: self.store.count_by_state(queue, JobState::Failed).await?,
        })
    }

    /// Flags queues whose backlog is growing past the configured threshold,
    /// or whose active count suggests a stall. Thresholds come from
    /// [`QueueConfig`], not from here.
    pub async fn health(&self) -> Result<Health, StoreError> {
        let mut issues = Vec::new();

        for queue in &self.queues {
            let stats = self.stats(&queue.name).await?;

            if stats.waiting > queue.backlog_threshold {
                issues.push(format!(
                    "queue {}: backlog of {} waiting jobs exceeds threshold {}",
                    queue.name, stats.waiting, queue.backlog_threshold
                ));
            }

            let stall_limit = (queue.concurrency as f64 * queue.stall_factor).ceil() as u64;
            if stats.active > stall_limit {
                issues.push(format!(
                    "queue {}: {} active jobs exceeds stall limit {}",
                    queue.name, stats.active, stall_limit
                ));
            }
        }

        Ok(Health {
            healthy: issues.is_empty(),
            issues,
        })
    }
}
