//! Webhook dispatcher — asynchronous occupancy notifications.
//!
//! Transitions are enqueued from the router hot path and delivered by an
//! independent worker task as a signed batch POST. Delivery is best
//! effort: transient failures (network error, 5xx) are retried with
//! exponential backoff up to a bounded attempt count, permanent failures
//! (4xx, exhausted retries) are logged and dropped. Nothing here can
//! block or fail a subscribe/publish operation.

use std::time::Duration;

use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ripple_core::{auth, App, WebhookEvent};

use crate::metrics::{WEBHOOKS_DROPPED_TOTAL, WEBHOOKS_ENQUEUED_TOTAL, WEBHOOK_ATTEMPTS_TOTAL};

/// Queue capacity for pending webhook batches.
const QUEUE_CAPACITY: usize = 1024;

/// Header carrying the app key.
pub const HEADER_KEY: &str = "X-Ripple-Key";
/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const HEADER_SIGNATURE: &str = "X-Ripple-Signature";

struct Job {
    app: App,
    events: Vec<WebhookEvent>,
}

/// Retry/backoff policy for a dispatcher.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delivery attempts per batch, including the first.
    pub attempts: u32,
    /// Base delay, doubled after each failed attempt.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Enqueue-and-return handle to the webhook worker.
#[derive(Clone)]
pub struct WebhookDispatcher {
    tx: mpsc::Sender<Job>,
}

impl WebhookDispatcher {
    /// Spawn the worker task and return the dispatcher handle.
    ///
    /// The worker exits when `cancel` fires or every dispatcher clone is
    /// dropped; in-flight retries are abandoned on cancellation.
    pub fn spawn(policy: RetryPolicy, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let handle = tokio::spawn(run_worker(rx, client, policy, cancel));
        (Self { tx }, handle)
    }

    /// Enqueue occupancy transitions for an app.
    ///
    /// A no-op when the app has webhooks disabled or `events` is empty.
    /// A full queue drops the batch (logged) rather than blocking.
    pub fn enqueue(&self, app: &App, events: Vec<WebhookEvent>) {
        if events.is_empty() || !app.wants_webhooks() {
            return;
        }
        counter!(WEBHOOKS_ENQUEUED_TOTAL).increment(1);
        let job = Job {
            app: app.clone(),
            events,
        };
        if self.tx.try_send(job).is_err() {
            counter!(WEBHOOKS_DROPPED_TOTAL).increment(1);
            warn!(app_id = %app.id, "webhook queue full, dropping batch");
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    client: reqwest::Client,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    // Held over from coalescing when the next job targets another app.
    let mut pending: Option<Job> = None;
    loop {
        let mut job = match pending.take() {
            Some(job) => job,
            None => tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
                () = cancel.cancelled() => return,
            },
        };

        // Coalesce queued batches for the same app, preserving order.
        while let Ok(next) = rx.try_recv() {
            if next.app.id == job.app.id {
                job.events.extend(next.events);
            } else {
                pending = Some(next);
                break;
            }
        }

        deliver(&client, &job, &policy, &cancel).await;
    }
}

/// Serialize, sign, and POST one batch, retrying transient failures.
async fn deliver(client: &reqwest::Client, job: &Job, policy: &RetryPolicy, cancel: &CancellationToken) {
    let Some(url) = job.app.webhook_url.as_deref() else {
        return;
    };
    let body = serde_json::to_string(&batch_body(&job.events)).unwrap_or_else(|_| "{}".into());
    let signature = auth::sign_bytes(&job.app.secret, body.as_bytes());

    let mut backoff = policy.base_backoff;
    for attempt in 1..=policy.attempts {
        let result = client
            .post(url)
            .header("Content-Type", "application/json")
            .header(HEADER_KEY, &job.app.key)
            .header(HEADER_SIGNATURE, &signature)
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                counter!(WEBHOOK_ATTEMPTS_TOTAL, "outcome" => "delivered").increment(1);
                debug!(app_id = %job.app.id, events = job.events.len(), "webhook delivered");
                return;
            }
            Ok(resp) if resp.status().is_client_error() => {
                // Permanent: the endpoint rejected the batch.
                counter!(WEBHOOK_ATTEMPTS_TOTAL, "outcome" => "rejected").increment(1);
                counter!(WEBHOOKS_DROPPED_TOTAL).increment(1);
                warn!(
                    app_id = %job.app.id,
                    status = resp.status().as_u16(),
                    "webhook rejected, dropping batch"
                );
                return;
            }
            Ok(resp) => {
                counter!(WEBHOOK_ATTEMPTS_TOTAL, "outcome" => "transient").increment(1);
                warn!(
                    app_id = %job.app.id,
                    status = resp.status().as_u16(),
                    attempt,
                    "webhook delivery failed"
                );
            }
            Err(e) => {
                counter!(WEBHOOK_ATTEMPTS_TOTAL, "outcome" => "transient").increment(1);
                warn!(app_id = %job.app.id, error = %e, attempt, "webhook delivery failed");
            }
        }

        if attempt < policy.attempts {
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = cancel.cancelled() => return,
            }
            backoff *= 2;
        }
    }

    counter!(WEBHOOKS_DROPPED_TOTAL).increment(1);
    warn!(app_id = %job.app.id, "webhook retries exhausted, dropping batch");
}

/// `{time_ms, events: [...]}` wire body.
fn batch_body(events: &[WebhookEvent]) -> Value {
    let events: Vec<Value> = events
        .iter()
        .map(|e| {
            let mut obj = json!({ "name": e.name, "channel": e.channel });
            if let Some(user_id) = &e.user_id {
                obj["user_id"] = json!(user_id);
            }
            obj
        })
        .collect();
    json!({
        "time_ms": chrono::Utc::now().timestamp_millis(),
        "events": events,
    })
}
