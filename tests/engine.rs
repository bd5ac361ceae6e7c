//! End-to-end tests running a full engine against a local HTTP stub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;

use conveyor::{
    signature, AttemptOutcome, Engine, EngineConfig, EnqueueOptions, ExecuteResult, Executor, Job,
    JobId, JobState, JobStore, MemoryStore, QueueConfig, Recurrence, WebhookConfig,
    HEADER_SIGNATURE, HEADER_TIMESTAMP,
};

/// One observed request: status decided, headers, body bytes.
struct StubState {
    hits: AtomicU32,
    /// Statuses to return, in order; the last one repeats
    statuses: Vec<u16>,
    requests: Mutex<Vec<(HeaderMap, Bytes)>>,
}

async fn stub_handler(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) as usize;
    state.requests.lock().unwrap().push((headers, body));
    let status = *state
        .statuses
        .get(hit)
        .or(state.statuses.last())
        .unwrap_or(&200);
    StatusCode::from_u16(status).unwrap()
}

async fn spawn_stub(statuses: Vec<u16>) -> (Arc<StubState>, SocketAddr, tokio::task::JoinHandle<()>) {
    let state = Arc::new(StubState {
        hits: AtomicU32::new(0),
        statuses,
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/hook", post(stub_handler))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr, handle)
}

/// Fast-cycling engine config for tests: millisecond backoff and ticks.
/// Also installs the log subscriber, so `RUST_LOG=conveyor=debug` traces a
/// failing test.
fn fast_config(queue: QueueConfig) -> EngineConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut config = EngineConfig::default()
        .queue(queue.backoff(Duration::from_millis(10), Duration::from_millis(50)))
        .poll_interval(Duration::from_millis(20));
    config.min_tick = Duration::from_millis(5);
    config
}

async fn wait_for_terminal(engine: &Engine, id: &JobId, timeout: Duration) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = engine.get_job(id).await.unwrap().unwrap();
        if job.state.is_terminal() {
            return job;
        }
        assert!(Instant::now() < deadline, "job {} did not settle in time", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn webhook_payload(addr: SocketAddr) -> serde_json::Value {
    serde_json::json!({
        "url": format!("http://{}/hook", addr),
        "event": "order.created",
        "data": {"hello": "world"}
    })
}

#[tokio::test]
async fn persistently_failing_webhook_exhausts_attempts() {
    let (stub, addr, server) = spawn_stub(vec![500]).await;

    let mut engine = Engine::new(fast_config(QueueConfig::new("hooks")));
    engine.register_webhook(WebhookConfig::default());
    engine.start().await;

    let id = engine
        .enqueue(
            "hooks",
            "webhook",
            webhook_payload(addr),
            EnqueueOptions {
                max_attempts: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.last_error.as_deref(), Some("HTTP 500"));

    let attempts = engine.attempts(&id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    for (i, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.attempt_number, (i + 1) as u32);
        assert_eq!(attempt.status_code, Some(500));
        assert_eq!(attempt.outcome, AttemptOutcome::Failure);
    }
    assert_eq!(stub.hits.load(Ordering::SeqCst), 3);

    engine.stop(Duration::from_secs(1)).await;
    server.abort();
}

#[tokio::test]
async fn webhook_succeeds_on_third_attempt_with_valid_signature() {
    let (stub, addr, server) = spawn_stub(vec![500, 500, 200]).await;

    let mut engine = Engine::new(fast_config(QueueConfig::new("hooks")));
    engine.register_webhook(WebhookConfig::default().with_secret("whsec_test"));
    engine.start().await;

    let id = engine
        .enqueue(
            "hooks",
            "webhook",
            webhook_payload(addr),
            EnqueueOptions {
                max_attempts: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 3);

    let attempts = engine.attempts(&id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Failure);
    assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
    assert_eq!(attempts[2].status_code, Some(200));

    // every request carries a signature the receiver can verify from the
    // timestamp header and raw body alone
    let requests = stub.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    for (headers, body) in requests.iter() {
        let ts_header = headers.get(HEADER_TIMESTAMP).unwrap().to_str().unwrap();
        let sig_header = headers.get(HEADER_SIGNATURE).unwrap().to_str().unwrap();

        let (t_part, v1_part) = sig_header.split_once(",v1=").unwrap();
        let ts: i64 = t_part.strip_prefix("t=").unwrap().parse().unwrap();
        assert_eq!(ts.to_string(), ts_header);
        assert_eq!(v1_part, signature("whsec_test", ts, body));
        assert_eq!(body.as_ref(), br#"{"hello":"world"}"#);
    }
    drop(requests);

    engine.stop(Duration::from_secs(1)).await;
    server.abort();
}

struct SlotRecorder {
    windows: Mutex<Vec<(Instant, Instant)>>,
    hold: Duration,
}

#[async_trait]
impl Executor for SlotRecorder {
    async fn execute(&self, _job: &Job) -> ExecuteResult {
        let start = Instant::now();
        tokio::time::sleep(self.hold).await;
        self.windows.lock().unwrap().push((start, Instant::now()));
        Ok(())
    }
}

#[tokio::test]
async fn concurrency_one_serializes_executions() {
    let recorder = Arc::new(SlotRecorder {
        windows: Mutex::new(Vec::new()),
        hold: Duration::from_millis(100),
    });

    let mut engine = Engine::new(fast_config(QueueConfig::new("serial").concurrency(1)));
    engine.register_executor("slot", Arc::clone(&recorder) as Arc<dyn Executor>, None);
    engine.start().await;

    let first = engine
        .enqueue("serial", "slot", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let second = engine
        .enqueue("serial", "slot", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let a = wait_for_terminal(&engine, &first, Duration::from_secs(10)).await;
    let b = wait_for_terminal(&engine, &second, Duration::from_secs(10)).await;
    assert_eq!(a.state, JobState::Completed);
    assert_eq!(b.state, JobState::Completed);

    let windows = recorder.windows.lock().unwrap();
    assert_eq!(windows.len(), 2);
    let (first_window, second_window) = if windows[0].0 <= windows[1].0 {
        (windows[0], windows[1])
    } else {
        (windows[1], windows[0])
    };
    assert!(
        first_window.1 <= second_window.0,
        "executions overlapped: {:?} vs {:?}",
        first_window,
        second_window
    );
    drop(windows);

    engine.stop(Duration::from_secs(1)).await;
}

struct CountingExecutor {
    runs: AtomicU32,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(&self, _job: &Job) -> ExecuteResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn overdue_recurring_job_catches_up_exactly_once() {
    let counter = Arc::new(CountingExecutor {
        runs: AtomicU32::new(0),
    });

    let mut engine = Engine::new(fast_config(QueueConfig::new("cron")));
    engine.register_executor("tick", Arc::clone(&counter) as Arc<dyn Executor>, None);

    // an hourly job that missed three occurrences while the engine was down
    let now = chrono::Utc::now();
    let overdue = Job::new("cron", "tick", serde_json::json!({}), now - chrono::Duration::hours(3))
        .with_recurrence(Recurrence::Every(Duration::from_secs(3600)))
        .delayed_until(now - chrono::Duration::hours(3));
    let id = engine.store().create(overdue).await.unwrap();

    engine.start().await;

    let job = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Completed);

    // give any spurious backlog runs a chance to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.runs.load(Ordering::SeqCst), 1);

    // the single successor is scheduled one interval from now, not from the
    // missed occurrences
    let store = engine.store();
    let delayed = store.list_by_state("cron", JobState::Delayed).await.unwrap();
    assert_eq!(delayed.len(), 1);
    let successor = &delayed[0];
    assert_eq!(successor.recurrence, job.recurrence);
    let lead = successor.next_run_at - chrono::Utc::now();
    assert!(lead > chrono::Duration::minutes(59), "lead was {}", lead);
    assert!(lead <= chrono::Duration::minutes(61), "lead was {}", lead);

    engine.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn lifecycle_events_arrive_in_transition_order() {
    let counter = Arc::new(CountingExecutor {
        runs: AtomicU32::new(0),
    });

    let mut engine = Engine::new(fast_config(QueueConfig::new("q")));
    engine.register_executor("tick", Arc::clone(&counter) as Arc<dyn Executor>, None);
    let mut sub = engine.subscribe();
    engine.start().await;

    let id = engine
        .enqueue("q", "tick", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;

    let mut transitions = Vec::new();
    while let Ok(event) = sub.receiver.try_recv() {
        assert_eq!(event.job_id, id);
        transitions.push((event.from, event.to));
    }
    assert_eq!(
        transitions,
        vec![
            (JobState::Waiting, JobState::Active),
            (JobState::Active, JobState::Completed),
        ]
    );

    engine.stop(Duration::from_secs(1)).await;
}

struct StartRecorder {
    starts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Executor for StartRecorder {
    async fn execute(&self, _job: &Job) -> ExecuteResult {
        self.starts.lock().unwrap().push(Instant::now());
        Ok(())
    }
}

#[tokio::test]
async fn rate_limited_dispatch_defers_to_the_next_window() {
    let recorder = Arc::new(StartRecorder {
        starts: Mutex::new(Vec::new()),
    });
    let window = Duration::from_millis(500);

    let mut engine = Engine::new(fast_config(
        QueueConfig::new("limited").concurrency(4).rate_limit(1, window),
    ));
    engine.register_executor("burst", Arc::clone(&recorder) as Arc<dyn Executor>, None);
    engine.start().await;

    let first = engine
        .enqueue("limited", "burst", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let second = engine
        .enqueue("limited", "burst", serde_json::json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    // the over-limit job is deferred, never rejected: both still complete
    let a = wait_for_terminal(&engine, &first, Duration::from_secs(10)).await;
    let b = wait_for_terminal(&engine, &second, Duration::from_secs(10)).await;
    assert_eq!(a.state, JobState::Completed);
    assert_eq!(b.state, JobState::Completed);

    // despite concurrency headroom, the second dispatch waits for the window
    // to roll over (margin allows for dispatch latency before the window
    // opened)
    let starts = recorder.starts.lock().unwrap();
    assert_eq!(starts.len(), 2);
    let gap = starts[1].duration_since(starts[0]);
    assert!(
        gap >= Duration::from_millis(400),
        "second dispatch came only {:?} after the first",
        gap
    );
    drop(starts);

    engine.stop(Duration::from_secs(1)).await;
}

struct Hanging;

#[async_trait]
impl Executor for Hanging {
    async fn execute(&self, _job: &Job) -> ExecuteResult {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test]
async fn restart_reclaims_job_abandoned_past_drain() {
    let store = Arc::new(MemoryStore::new());

    // first engine: claims the job, then is stopped with a drain too short
    // for the hanging execution to finish
    let mut config = fast_config(QueueConfig::new("q"));
    config.heartbeat_interval = Duration::from_secs(60);
    let mut first = Engine::with_store(config, Arc::clone(&store) as Arc<dyn JobStore>);
    first.register_executor("task", Arc::new(Hanging), None);
    first.start().await;

    let id = first
        .enqueue(
            "q",
            "task",
            serde_json::json!({}),
            EnqueueOptions {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = first.get_job(&id).await.unwrap().unwrap();
        if job.state == JobState::Active {
            break;
        }
        assert!(Instant::now() < deadline, "job was never claimed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    first.stop(Duration::from_millis(50)).await;

    let abandoned = store.get(&id).await.unwrap().unwrap();
    assert_eq!(abandoned.state, JobState::Active);
    assert_eq!(abandoned.attempts_made, 1);

    // let the claim-time heartbeat go stale
    tokio::time::sleep(Duration::from_millis(300)).await;

    // second engine over the same store reclaims the orphan and re-runs it
    let counter = Arc::new(CountingExecutor {
        runs: AtomicU32::new(0),
    });
    let config = fast_config(QueueConfig::new("q"))
        .staleness_threshold(Duration::from_millis(200));
    let mut second = Engine::with_store(config, Arc::clone(&store) as Arc<dyn JobStore>);
    second.register_executor("task", Arc::clone(&counter) as Arc<dyn Executor>, None);
    second.start().await;

    let job = wait_for_terminal(&second, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Completed);
    // the interrupted attempt plus the rerun
    assert_eq!(job.attempts_made, 2);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 1);

    second.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn manual_retry_requeues_a_failed_job() {
    let (stub, addr, server) = spawn_stub(vec![500, 200]).await;

    let mut engine = Engine::new(fast_config(QueueConfig::new("hooks")));
    engine.register_webhook(WebhookConfig::default());
    engine.start().await;

    let id = engine
        .enqueue(
            "hooks",
            "webhook",
            webhook_payload(addr),
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 1);

    engine.retry(&id).await.unwrap();
    let job = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(stub.hits.load(Ordering::SeqCst), 2);

    engine.stop(Duration::from_secs(1)).await;
    server.abort();
}

#[tokio::test]
async fn stats_reflect_settled_jobs() {
    let (_stub, addr, server) = spawn_stub(vec![200]).await;

    let mut engine = Engine::new(fast_config(QueueConfig::new("hooks")));
    engine.register_webhook(WebhookConfig::default());
    engine.start().await;

    let id = engine
        .enqueue("hooks", "webhook", webhook_payload(addr), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;

    let stats = engine.stats("hooks").await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting + stats.delayed + stats.active + stats.failed, 0);

    let health = engine.health().await.unwrap();
    assert!(health.healthy, "issues: {:?}", health.issues);

    engine.stop(Duration::from_secs(1)).await;
    server.abort();
}
