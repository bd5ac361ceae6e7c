use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{QueueConfig, RateLimit};
use crate::error::StoreError;
use crate::events::{EventBus, JobEvent};
use crate::executor::ExecutorRegistry;
use crate::job::{Job, JobId, JobState};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::{JobStore, StateChange};

/// Fixed-window dispatch counter. Exceeding the window defers dispatch until
/// the window rolls over; jobs stay `waiting`, nothing is rejected.
pub(crate) struct RateWindow {
    limit: RateLimit,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    count: u32,
}

impl RateWindow {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Whether a dispatch at `now` fits in the current window.
    pub(crate) fn would_allow(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(state.started) >= self.limit.window {
            state.started = now;
            state.count = 0;
        }
        state.count < self.limit.max
    }

    /// Count one dispatch against the current window.
    pub(crate) fn record(&self, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(state.started) >= self.limit.window {
            state.started = now;
            state.count = 0;
        }
        state.count += 1;
    }
}

/// Per-queue dispatch loop.
///
/// Claims ready jobs through the store's compare-and-swap, enforces the
/// queue's concurrency and rate limits, and hands claimed jobs to their
/// executor on the task tracker. All cross-worker coordination goes through
/// `JobStore::transition`; a `Conflict` just means another dispatcher won the
/// claim.
pub(crate) struct Dispatcher {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) executors: Arc<ExecutorRegistry>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) queue: QueueConfig,
    pub(crate) poll_interval: Duration,
    pub(crate) min_tick: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) tracker: TaskTracker,
}

impl Dispatcher {
    /// Run the dispatch loop until shutdown is signaled. New claims stop
    /// immediately on cancellation; in-flight executions drain through the
    /// task tracker.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        info!(queue = %self.queue.name, "Dispatcher started");

        let permits = Arc::new(Semaphore::new(self.queue.concurrency));
        let rate = self.queue.rate_limit.map(RateWindow::new);
        let retry = RetryPolicy::for_queue(&self.queue);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(queue = %self.queue.name, "Dispatcher shutting down");
                    break;
                }
                _ = self.tick(&permits, rate.as_ref(), &retry) => {}
            }
        }
    }

    /// Claim and dispatch everything currently allowed, then sleep until the
    /// next due time (bounded below by the minimum tick, above by the poll
    /// interval).
    async fn tick(&self, permits: &Arc<Semaphore>, rate: Option<&RateWindow>, retry: &RetryPolicy) {
        loop {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                break;
            };

            if let Some(rate) = rate {
                if !rate.would_allow(Instant::now()) {
                    debug!(queue = %self.queue.name, "Rate limit reached, deferring dispatch");
                    drop(permit);
                    break;
                }
            }

            let now = self.clock.now();
            let Some(id) = self.scheduler.next_ready(&self.queue.name, now) else {
                drop(permit);
                break;
            };

            match self.claim(&id).await {
                Some(job) => {
                    if let Some(rate) = rate {
                        rate.record(Instant::now());
                    }
                    self.spawn_execution(job, permit, retry.clone());
                }
                // Lost the race or the heap entry was stale; try the next one.
                None => drop(permit),
            }
        }

        let now = self.clock.now();
        let until_due = self
            .scheduler
            .next_wakeup(&self.queue.name)
            .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.poll_interval);
        let sleep_for = until_due.min(self.poll_interval).max(self.min_tick);
        tokio::time::sleep(sleep_for).await;
    }

    /// Promote a due delayed job and claim it, tolerating races.
    async fn claim(&self, id: &JobId) -> Option<Job> {
        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(error) => {
                error!(queue = %self.queue.name, job_id = %id, %error, "Failed to load job");
                return None;
            }
        };

        let now = self.clock.now();
        match job.state {
            JobState::Delayed if job.next_run_at <= now => {
                match self.store.transition(id, StateChange::Promote).await {
                    Ok(promoted) => {
                        self.publish(&promoted, JobState::Delayed, JobState::Waiting, None)
                    }
                    Err(StoreError::Conflict { .. }) => return None,
                    Err(error) => {
                        error!(job_id = %id, %error, "Failed to promote delayed job");
                        return None;
                    }
                }
            }
            JobState::Waiting => {}
            // Stale heap entry: rescheduled, claimed elsewhere, or terminal.
            _ => return None,
        }

        match self.store.transition(id, StateChange::Claim { at: now }).await {
            Ok(claimed) => {
                debug!(job_id = %id, kind = %claimed.kind, attempt = claimed.attempts_made, "Claimed job");
                self.publish(&claimed, JobState::Waiting, JobState::Active, None);
                Some(claimed)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(job_id = %id, "Lost claim race");
                None
            }
            Err(error) => {
                error!(job_id = %id, %error, "Failed to claim job");
                None
            }
        }
    }

    fn spawn_execution(
        &self,
        job: Job,
        permit: tokio::sync::OwnedSemaphorePermit,
        retry: RetryPolicy,
    ) {
        let store = Arc::clone(&self.store);
        let scheduler = Arc::clone(&self.scheduler);
        let executors = Arc::clone(&self.executors);
        let events = Arc::clone(&self.events);
        let clock = Arc::clone(&self.clock);
        let heartbeat_interval = self.heartbeat_interval;

        self.tracker.spawn(async move {
            let _permit = permit;
            let result =
                execute_with_heartbeat(&executors, &store, &clock, &job, heartbeat_interval).await;
            settle(&store, &scheduler, &events, &clock, &retry, job, result).await;
        });
    }

    fn publish(&self, job: &Job, from: JobState, to: JobState, reason: Option<String>) {
        self.events.publish(JobEvent {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            from,
            to,
            at: self.clock.now(),
            reason,
        });
    }
}

/// Run the executor while heartbeating the job, so a crashed process is
/// distinguishable from a slow one.
async fn execute_with_heartbeat(
    executors: &ExecutorRegistry,
    store: &Arc<dyn JobStore>,
    clock: &Arc<dyn Clock>,
    job: &Job,
    heartbeat_interval: Duration,
) -> crate::executor::ExecuteResult {
    let exec = executors.execute(job);
    tokio::pin!(exec);

    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            result = &mut exec => break result,
            _ = ticker.tick() => {
                if let Err(error) = store.heartbeat(&job.id, clock.now()).await {
                    warn!(job_id = %job.id, %error, "Heartbeat failed");
                }
            }
        }
    }
}

/// Record the outcome of a finished attempt: completion (and the next
/// recurrence), a backoff retry, or terminal failure.
async fn settle(
    store: &Arc<dyn JobStore>,
    scheduler: &Arc<Scheduler>,
    events: &Arc<EventBus>,
    clock: &Arc<dyn Clock>,
    retry: &RetryPolicy,
    job: Job,
    result: crate::executor::ExecuteResult,
) {
    let now = clock.now();

    let publish = |job: &Job, to: JobState, reason: Option<String>| {
        events.publish(JobEvent {
            job_id: job.id.clone(),
            queue_name: job.queue_name.clone(),
            from: JobState::Active,
            to,
            at: now,
            reason,
        });
    };

    match result {
        Ok(()) => {
            info!(job_id = %job.id, kind = %job.kind, "Job completed");
            match store.transition(&job.id, StateChange::Complete { at: now }).await {
                Ok(completed) => {
                    publish(&completed, JobState::Completed, None);
                    if let Some(recurrence) = &completed.recurrence {
                        match Scheduler::next_occurrence(recurrence, now) {
                            Ok(next_run) => {
                                let next = Job::new(
                                    completed.queue_name.clone(),
                                    completed.kind.clone(),
                                    completed.payload.clone(),
                                    now,
                                )
                                .with_max_attempts(completed.max_attempts)
                                .with_recurrence(recurrence.clone())
                                .delayed_until(next_run);

                                debug!(
                                    job_id = %completed.id,
                                    next_id = %next.id,
                                    next_run = %next_run,
                                    "Scheduling next recurrence"
                                );
                                match store.create(next.clone()).await {
                                    Ok(_) => scheduler.schedule(&next),
                                    Err(error) => {
                                        error!(job_id = %completed.id, %error, "Failed to create recurrence")
                                    }
                                }
                            }
                            Err(error) => {
                                error!(job_id = %completed.id, %error, "Invalid recurrence rule")
                            }
                        }
                    }
                }
                Err(error) => {
                    // Most likely reclaimed as stale while we were finishing.
                    warn!(job_id = %job.id, %error, "Failed to mark job completed");
                }
            }
        }
        Err(execute_error) => {
            let reason = execute_error.to_string();

            if execute_error.is_retryable() && retry.should_retry(&job) {
                let delay = retry.next_delay(&job);
                let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    %reason,
                    retry_in = ?delay,
                    "Job failed, scheduling retry"
                );

                let change = StateChange::RetryAt {
                    at: run_at,
                    error: reason.clone(),
                };
                match store.transition(&job.id, change).await {
                    Ok(delayed) => {
                        publish(&delayed, JobState::Delayed, Some(reason));
                        scheduler.reschedule(&delayed);
                    }
                    Err(error) => {
                        warn!(job_id = %job.id, %error, "Failed to schedule retry")
                    }
                }
            } else {
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    %reason,
                    "Job failed permanently"
                );

                let change = StateChange::Fail {
                    at: now,
                    error: reason.clone(),
                };
                match store.transition(&job.id, change).await {
                    Ok(failed) => publish(&failed, JobState::Failed, Some(reason)),
                    Err(error) => {
                        warn!(job_id = %job.id, %error, "Failed to mark job failed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_caps_dispatches_within_a_window() {
        let window = RateWindow::new(RateLimit {
            max: 2,
            window: Duration::from_secs(10),
        });
        let t0 = Instant::now();

        assert!(window.would_allow(t0));
        window.record(t0);
        assert!(window.would_allow(t0));
        window.record(t0);
        assert!(!window.would_allow(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn rate_window_resets_after_rollover() {
        let window = RateWindow::new(RateLimit {
            max: 1,
            window: Duration::from_secs(10),
        });
        let t0 = Instant::now();

        window.record(t0);
        assert!(!window.would_allow(t0 + Duration::from_secs(9)));
        assert!(window.would_allow(t0 + Duration::from_secs(10)));
    }
}
