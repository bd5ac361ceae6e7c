use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::clock::Clock;
use crate::config::WebhookConfig;
use crate::error::ExecuteError;
use crate::executor::{ExecuteResult, Executor};
use crate::job::{AttemptOutcome, DeliveryAttempt, Job};
use crate::store::JobStore;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Payload shape required of `"webhook"` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub url: String,
    /// Event name sent in the `X-Webhook-Event` header
    pub event: String,
    /// Request body; serialized bytes are exactly what gets signed
    pub data: serde_json::Value,
}

impl WebhookPayload {
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ExecuteError> {
        serde_json::from_value(value.clone())
            .map_err(|e| ExecuteError::MalformedPayload(e.to_string()))
    }
}

/// Hex-encoded `HMAC-SHA256(secret, "{timestamp}.{body}")`.
pub fn signature(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Full signature header value: `t=<timestamp>,v1=<hex>`.
///
/// Binding the timestamp into the signed string lets receivers reject
/// replayed payloads outside their tolerance window.
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> String {
    format!("t={},v1={}", timestamp, signature(secret, timestamp, body))
}

fn truncate_snippet(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Delivers webhook jobs: an HTTP POST with the signed payload, with an
/// append-only [`DeliveryAttempt`] audit trail.
///
/// A `Pending` attempt row is persisted before the request and resolved after
/// it, so a crash mid-request leaves an attributable record rather than a
/// silently lost attempt. Non-2xx responses and transport errors are the same
/// kind of failure; the retry policy does not distinguish them.
pub struct WebhookDeliveryExecutor {
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
    config: WebhookConfig,
    clock: Arc<dyn Clock>,
}

impl WebhookDeliveryExecutor {
    pub fn new(store: Arc<dyn JobStore>, config: WebhookConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            config,
            clock,
        }
    }

    async fn resolve(
        &self,
        job: &Job,
        attempt_number: u32,
        status_code: Option<u16>,
        duration_ms: u64,
        snippet: Option<String>,
        outcome: AttemptOutcome,
    ) {
        let result = self
            .store
            .resolve_attempt(
                &job.id,
                attempt_number,
                status_code,
                duration_ms,
                snippet,
                outcome,
            )
            .await;
        if let Err(error) = result {
            tracing::error!(job_id = %job.id, %error, "Failed to record delivery attempt outcome");
        }
    }
}

#[async_trait]
impl Executor for WebhookDeliveryExecutor {
    async fn execute(&self, job: &Job) -> ExecuteResult {
        let payload = WebhookPayload::from_value(&job.payload)?;

        let body = serde_json::to_vec(&payload.data)
            .map_err(|e| ExecuteError::MalformedPayload(e.to_string()))?;

        let now = self.clock.now();
        let timestamp = now.timestamp();
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let attempt_number = job.attempts_made;

        self.store
            .append_attempt(DeliveryAttempt {
                job_id: job.id.clone(),
                attempt_number,
                url: payload.url.clone(),
                status_code: None,
                duration_ms: 0,
                response_snippet: None,
                outcome: AttemptOutcome::Pending,
                started_at: now,
            })
            .await
            .map_err(|e| ExecuteError::Failed(e.to_string()))?;

        let mut request = self
            .client
            .post(&payload.url)
            .timeout(self.config.timeout)
            .header("Content-Type", "application/json")
            .header(HEADER_EVENT, &payload.event)
            .header(HEADER_DELIVERY, &delivery_id)
            .header(HEADER_TIMESTAMP, timestamp.to_string());

        if let Some(secret) = &self.config.secret {
            request = request.header(HEADER_SIGNATURE, signature_header(secret, timestamp, &body));
        }

        debug!(
            job_id = %job.id,
            url = %payload.url,
            attempt = attempt_number,
            delivery_id = %delivery_id,
            "Delivering webhook"
        );

        let started = Instant::now();
        let response = request.body(body).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let status = response.status();
                let snippet = response
                    .text()
                    .await
                    .ok()
                    .map(|text| truncate_snippet(text, self.config.snippet_limit));

                if status.is_success() {
                    self.resolve(
                        job,
                        attempt_number,
                        Some(status.as_u16()),
                        duration_ms,
                        snippet,
                        AttemptOutcome::Success,
                    )
                    .await;
                    Ok(())
                } else {
                    self.resolve(
                        job,
                        attempt_number,
                        Some(status.as_u16()),
                        duration_ms,
                        snippet,
                        AttemptOutcome::Failure,
                    )
                    .await;
                    Err(ExecuteError::Failed(format!("HTTP {}", status.as_u16())))
                }
            }
            Err(error) => {
                self.resolve(
                    job,
                    attempt_number,
                    None,
                    duration_ms,
                    None,
                    AttemptOutcome::Failure,
                )
                .await;
                Err(ExecuteError::Failed(format!("Transport error: {}", error)))
            }
        }
    }
}
