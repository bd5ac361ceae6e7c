use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinError;

use crate::error::ExecuteError;
use crate::job::Job;

pub type ExecuteResult = Result<(), ExecuteError>;

/// Performs one job's side effect.
///
/// Implementations must treat each attempt as atomic: there is no partial
/// progress carried between attempts, a failed attempt retries from scratch.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecuteResult;
}

struct RegisteredExecutor {
    executor: Arc<dyn Executor>,
    timeout: Option<Duration>,
}

/// Kind-keyed registry resolving jobs to their executor.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, RegisteredExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<S: Into<String>>(
        &self,
        kind: S,
        executor: Arc<dyn Executor>,
        timeout: Option<Duration>,
    ) {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        executors.insert(kind.into(), RegisteredExecutor { executor, timeout });
    }

    pub fn has_executor(&self, kind: &str) -> bool {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors.contains_key(kind)
    }

    /// Execute a job with its registered executor, enforcing the configured
    /// timeout. Runs on a separate task so a panicking executor is reported
    /// as a failure instead of unwinding through the dispatch loop.
    pub async fn execute(&self, job: &Job) -> ExecuteResult {
        let (executor, timeout) = {
            let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
            let registered = executors
                .get(&job.kind)
                .ok_or_else(|| ExecuteError::UnknownKind(job.kind.clone()))?;
            (Arc::clone(&registered.executor), registered.timeout)
        };

        let owned = job.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&owned).await });

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                ExecuteError::Failed("Executor panicked".to_string())
            } else {
                ExecuteError::Failed("Executor cancelled".to_string())
            }
        };

        match timeout {
            Some(duration) => {
                tokio::select! {
                    res = &mut handle => res.map_err(join_to_error)?,
                    _ = tokio::time::sleep(duration) => {
                        handle.abort();
                        Err(ExecuteError::Timeout(duration))
                    }
                }
            }
            None => handle.await.map_err(join_to_error)?,
        }
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
