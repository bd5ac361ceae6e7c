use std::time::Duration;

/// Rolling-window dispatch rate limit for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum dispatches per window
    pub max: u32,
    pub window: Duration,
}

/// Bounds on how long terminal (completed/failed) jobs are retained before
/// the reaper purges them. `None` means unbounded on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many terminal jobs per queue, newest first
    pub max_count: Option<usize>,
    /// Purge terminal jobs older than this
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    pub fn keep_last(count: usize) -> Self {
        Self {
            max_count: Some(count),
            max_age: None,
        }
    }
}

/// Per-queue configuration. Immutable once the engine has started.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum simultaneously active jobs
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    /// Attempt ceiling applied when the caller does not specify one
    pub default_max_attempts: u32,
    /// First retry delay; doubles each attempt
    pub backoff_base: Duration,
    /// Retry delay never exceeds this
    pub backoff_cap: Duration,
    pub retention: RetentionPolicy,
    /// `health()` flags the queue when `waiting` exceeds this
    pub backlog_threshold: u64,
    /// `health()` flags the queue when `active > concurrency * stall_factor`
    pub stall_factor: f64,
}

impl QueueConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            rate_limit: None,
            default_max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(3600),
            retention: RetentionPolicy::default(),
            backlog_threshold: 1000,
            stall_factor: 1.0,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, window });
        self
    }

    pub fn default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn backlog_threshold(mut self, threshold: u64) -> Self {
        self.backlog_threshold = threshold;
        self
    }

    pub fn stall_factor(mut self, factor: f64) -> Self {
        self.stall_factor = factor;
        self
    }
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// HMAC-SHA256 signing secret; unsigned requests are sent when absent
    pub secret: Option<String>,
    /// Hard per-request timeout
    pub timeout: Duration,
    /// Response bodies are truncated to this many bytes before storage
    pub snippet_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout: Duration::from_secs(30),
            snippet_limit: 1024,
        }
    }
}

impl WebhookConfig {
    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queues: Vec<QueueConfig>,
    /// Enqueue rejects payloads serializing beyond this
    pub max_payload_bytes: usize,
    /// Upper bound on dispatcher sleep when nothing is due
    pub poll_interval: Duration,
    /// Lower bound on dispatcher sleep, so a near-future job never causes
    /// busy-polling
    pub min_tick: Duration,
    /// How often active jobs heartbeat
    pub heartbeat_interval: Duration,
    /// Active jobs whose heartbeat is older than this are presumed orphaned
    /// and reclaimed on start
    pub staleness_threshold: Duration,
    /// How often the retention reaper sweeps terminal jobs
    pub reaper_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            max_payload_bytes: 256 * 1024,
            poll_interval: Duration::from_millis(500),
            min_tick: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn queue(mut self, config: QueueConfig) -> Self {
        self.queues.push(config);
        self
    }

    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub(crate) fn queue_config(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}
