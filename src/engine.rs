use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, WebhookConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{EnqueueError, StoreError};
use crate::events::{EventBus, JobEvent, Subscription};
use crate::executor::{Executor, ExecutorRegistry};
use crate::job::{DeliveryAttempt, Job, JobId, JobState, Recurrence};
use crate::scheduler::Scheduler;
use crate::stats::{Health, QueueStats, StatsAggregator};
use crate::store::{JobStore, MemoryStore, StateChange};
use crate::webhook::WebhookDeliveryExecutor;

/// Options accepted at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the job back this long before it becomes eligible
    pub delay: Option<Duration>,
    /// Attempt ceiling; the queue's default applies when absent
    pub max_attempts: Option<u32>,
    pub recurrence: Option<Recurrence>,
}

/// The job engine: enqueue surface, dispatch loops, and read side.
///
/// An `Engine` is an explicit instance handed to callers by reference; there
/// is no global registry, so tests can run multiple isolated engines side by
/// side.
///
/// # Example
/// ```ignore
/// let config = EngineConfig::default().queue(QueueConfig::new("webhooks").concurrency(4));
/// let mut engine = Engine::new(config);
/// engine.register_webhook(WebhookConfig::default().with_secret("whsec_..."));
/// engine.start().await;
///
/// let id = engine.enqueue(
///     "webhooks",
///     "webhook",
///     serde_json::json!({"url": "...", "event": "order.created", "data": {}}),
///     EnqueueOptions::default(),
/// )?;
/// ```
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    scheduler: Arc<Scheduler>,
    executors: Arc<ExecutorRegistry>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher_handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Create an engine backed by the in-memory store and system clock.
    /// Dispatchers do not run until [`start`](Self::start).
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create an engine on an externally provided store.
    pub fn with_store(config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            store,
            scheduler: Arc::new(Scheduler::new()),
            executors: Arc::new(ExecutorRegistry::new()),
            events: Arc::new(EventBus::new()),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            dispatcher_handles: Vec::new(),
            reaper_handle: None,
        }
    }

    /// Swap the time source; useful for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Register an executor for a job kind, with an optional hard timeout
    /// per attempt.
    pub fn register_executor<S: Into<String>>(
        &self,
        kind: S,
        executor: Arc<dyn Executor>,
        timeout: Option<Duration>,
    ) {
        self.executors.register(kind, executor, timeout);
    }

    /// Register the webhook delivery executor under the `"webhook"` kind.
    pub fn register_webhook(&self, config: WebhookConfig) {
        let executor = WebhookDeliveryExecutor::new(
            Arc::clone(&self.store),
            config,
            Arc::clone(&self.clock),
        );
        self.executors.register("webhook", Arc::new(executor), None);
    }

    /// Validate and persist a job, returning its id. This is fire-and-forget:
    /// completion is observed via [`subscribe`](Self::subscribe),
    /// [`get_job`](Self::get_job), or [`stats`](Self::stats), never by
    /// blocking the caller.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        kind: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, EnqueueError> {
        if queue_name.is_empty() {
            return Err(EnqueueError::EmptyQueueName);
        }
        let queue = self
            .config
            .queue_config(queue_name)
            .ok_or_else(|| EnqueueError::UnknownQueue(queue_name.to_string()))?;

        let size = serde_json::to_vec(&payload)?.len();
        if size > self.config.max_payload_bytes {
            return Err(EnqueueError::PayloadTooLarge {
                size,
                limit: self.config.max_payload_bytes,
            });
        }

        if let Some(Recurrence::Cron(expr)) = &options.recurrence {
            Scheduler::validate_cron(expr).map_err(EnqueueError::InvalidCron)?;
        }

        let now = self.clock.now();
        let mut job = Job::new(queue_name, kind, payload, now)
            .with_max_attempts(options.max_attempts.unwrap_or(queue.default_max_attempts));
        if let Some(delay) = options.delay.filter(|d| !d.is_zero()) {
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            job = job.delayed_until(run_at);
        }
        if let Some(recurrence) = options.recurrence {
            job = job.with_recurrence(recurrence);
        }

        let id = self.store.create(job.clone()).await?;
        self.scheduler.schedule(&job);
        info!(job_id = %id, queue = %queue_name, kind = %kind, "Job enqueued");
        Ok(id)
    }

    /// Reclaim stale jobs, rebuild the ready queue from the store, and spawn
    /// one dispatch loop per configured queue plus the retention reaper.
    pub async fn start(&mut self) {
        let staleness = chrono::Duration::from_std(self.config.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        for queue in &self.config.queues {
            let now = self.clock.now();
            match self
                .store
                .reclaim_stale(&queue.name, now - staleness, now)
                .await
            {
                Ok(reclaimed) => {
                    for job in &reclaimed {
                        warn!(
                            job_id = %job.id,
                            queue = %job.queue_name,
                            state = %job.state,
                            "Reclaimed stale active job"
                        );
                        self.events.publish(JobEvent {
                            job_id: job.id.clone(),
                            queue_name: job.queue_name.clone(),
                            from: JobState::Active,
                            to: job.state,
                            at: now,
                            reason: Some("stale ownership".to_string()),
                        });
                    }
                }
                Err(error) => {
                    warn!(queue = %queue.name, %error, "Stale reclaim failed")
                }
            }

            for state in [JobState::Waiting, JobState::Delayed] {
                match self.store.list_by_state(&queue.name, state).await {
                    Ok(jobs) => {
                        for job in &jobs {
                            self.scheduler.schedule(job);
                        }
                    }
                    Err(error) => {
                        warn!(queue = %queue.name, %error, "Failed to rebuild ready queue")
                    }
                }
            }

            let dispatcher = Dispatcher {
                store: Arc::clone(&self.store),
                scheduler: Arc::clone(&self.scheduler),
                executors: Arc::clone(&self.executors),
                events: Arc::clone(&self.events),
                clock: Arc::clone(&self.clock),
                queue: queue.clone(),
                poll_interval: self.config.poll_interval,
                min_tick: self.config.min_tick,
                heartbeat_interval: self.config.heartbeat_interval,
                tracker: self.tracker.clone(),
            };
            let shutdown = self.shutdown.clone();
            self.dispatcher_handles
                .push(tokio::spawn(async move { dispatcher.run(shutdown).await }));
        }

        self.start_reaper();
        info!(queues = self.config.queues.len(), "Engine started");
    }

    fn start_reaper(&mut self) {
        if self.reaper_handle.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let queues = self.config.queues.clone();
        let interval = self.config.reaper_interval;
        let shutdown = self.shutdown.clone();

        self.reaper_handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for queue in &queues {
                            match store.purge_terminal(&queue.name, &queue.retention, clock.now()).await {
                                Ok(0) => {}
                                Ok(purged) => {
                                    info!(queue = %queue.name, purged, "Purged retained jobs")
                                }
                                Err(error) => {
                                    warn!(queue = %queue.name, %error, "Retention purge failed")
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Stop claiming new jobs immediately and wait up to `drain_timeout` for
    /// active executions to finish. Jobs still running after the timeout are
    /// abandoned in `active`; the next [`start`](Self::start) reclaims them
    /// once their heartbeat goes stale.
    pub async fn stop(&mut self, drain_timeout: Duration) {
        info!("Engine stopping");
        self.shutdown.cancel();

        for handle in self.dispatcher_handles.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.reaper_handle.take() {
            let _ = handle.await;
        }

        self.tracker.close();
        if tokio::time::timeout(drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                abandoned = self.tracker.len(),
                "Drain timeout elapsed; abandoning active jobs for stale reclaim"
            );
        } else {
            info!("Engine stopped");
        }
    }

    /// Wait for Ctrl+C, then stop with the given drain timeout.
    pub async fn wait_for_shutdown(&mut self, drain_timeout: Duration) {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        self.stop(drain_timeout).await;
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id).await
    }

    /// Delivery attempt audit trail for a job, in attempt order.
    pub async fn attempts(&self, id: &JobId) -> Result<Vec<DeliveryAttempt>, StoreError> {
        self.store.attempts(id).await
    }

    /// Manually re-enqueue a terminally failed job, resetting its attempts.
    pub async fn retry(&self, id: &JobId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let job = self
            .store
            .transition(id, StateChange::Requeue { at: now })
            .await?;
        self.events.publish(JobEvent {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            from: JobState::Failed,
            to: JobState::Waiting,
            at: now,
            reason: None,
        });
        self.scheduler.schedule(&job);
        Ok(())
    }

    pub async fn delete(&self, id: &JobId) -> Result<(), StoreError> {
        self.store.delete(id).await
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        self.aggregator().stats(queue).await
    }

    pub async fn health(&self) -> Result<Health, StoreError> {
        self.aggregator().health().await
    }

    /// Observe job state transitions. Dropping the subscription (or calling
    /// [`unsubscribe`](Self::unsubscribe)) stops delivery.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.events.unsubscribe(id);
    }

    fn aggregator(&self) -> StatsAggregator {
        StatsAggregator::new(Arc::clone(&self.store), self.config.queues.clone())
    }
}
