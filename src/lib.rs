//! Conveyor: an embeddable at-least-once background job queue.
//!
//! Jobs are enqueued into named queues, dispatched to registered executors
//! under per-queue concurrency and rate limits, and retried with capped
//! exponential backoff. Delivery of `"webhook"` jobs signs each HTTP request
//! with HMAC-SHA256 and keeps a per-attempt audit trail.
//!
//! ```ignore
//! use conveyor::{Engine, EngineConfig, EnqueueOptions, QueueConfig, WebhookConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig::default()
//!         .queue(QueueConfig::new("webhooks").concurrency(4));
//!     let mut engine = Engine::new(config);
//!     engine.register_webhook(WebhookConfig::default().with_secret("whsec_..."));
//!     engine.start().await;
//!
//!     engine
//!         .enqueue(
//!             "webhooks",
//!             "webhook",
//!             serde_json::json!({
//!                 "url": "https://example.com/hooks",
//!                 "event": "order.created",
//!                 "data": {"order_id": 42}
//!             }),
//!             EnqueueOptions::default(),
//!         )
//!         .await
//!         .unwrap();
//!
//!     engine.wait_for_shutdown(std::time::Duration::from_secs(30)).await;
//! }
//! ```

mod clock;
mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
mod executor;
mod job;
mod retry;
mod scheduler;
mod stats;
mod store;
mod webhook;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, QueueConfig, RateLimit, RetentionPolicy, WebhookConfig};
pub use engine::{Engine, EnqueueOptions};
pub use error::{EnqueueError, ExecuteError, StoreError};
pub use events::{EventBus, JobEvent, Subscription};
pub use executor::{ExecuteResult, Executor, ExecutorRegistry};
pub use job::{AttemptOutcome, DeliveryAttempt, Job, JobId, JobState, Recurrence};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use stats::{Health, QueueStats, StatsAggregator};
pub use store::{JobStore, MemoryStore, StateChange};
pub use webhook::{
    signature, signature_header, WebhookDeliveryExecutor, WebhookPayload, HEADER_DELIVERY,
    HEADER_EVENT, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
