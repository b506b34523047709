//! Webhook dispatch: claim, sign, send, process results.
//!
//! ```text
//! dispatcher.tick()
//!   ├─ claim_and_send()
//!   │    ├─ storage: claim_due_webhooks()     // pending + due, leased for `claim_lease`
//!   │    └─ for each claimed job:
//!   │         ├─ build WebhookPayload from the job's current state
//!   │         ├─ CPU: Signer::headers()       // only with a signing secret
//!   │         └─ send_tx.try_send(request) ──────────────────────┐
//!   │                                                             │
//!   │              ┌──────────────────────────────────────────────┘
//!   │              ▼
//!   │         run_sender (spawned task):
//!   │              ├─ recv from send_rx
//!   │              ├─ acquire semaphore permit (caps concurrency)
//!   │              ├─ spawn HTTP POST
//!   │              └─ result_tx.send(result) ────────────────────┐
//!   │                                                             │
//!   └─ drain_results()                                            │
//!        ├─ result_rx.try_recv() ◄───────────────────────────────┘
//!        └─ storage: append_webhook_attempt()  // delivered, backoff, or failed
//! ```
//!
//! The sender task has no storage access and no secrets. Deliveries lost on shutdown become
//! claimable again once their lease runs out. Job state never waits on any of this.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{CarouselError, Result};
use crate::job::{DeliveryOutcome, JobId, WebhookAttempt, WebhookStatus};
use crate::retry::RetryConfig;
use crate::storage::Storage;
use crate::webhooks::events::WebhookPayload;
use crate::webhooks::signing::Signer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Run the dispatcher at all
    pub enabled: bool,
    /// `whsec_` prefixed base64 secret. Deliveries are unsigned without one.
    pub signing_secret: Option<String>,
    /// Per-request HTTP timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Fallback polling interval when no job events arrive
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a claimed delivery stays invisible to other claims
    #[serde(with = "humantime_serde")]
    pub claim_lease: Duration,
    pub claim_batch_size: usize,
    pub max_concurrent_sends: usize,
    pub channel_capacity: usize,
    /// Backoff between failed attempts; `max_attempts` consecutive failures give up
    pub retry: RetryConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signing_secret: None,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(300),
            claim_batch_size: 50,
            max_concurrent_sends: 16,
            channel_capacity: 256,
            retry: RetryConfig {
                max_attempts: 5,
                backoff_ms: 1000,
                backoff_factor: 2,
                max_backoff_ms: 60_000,
            },
        }
    }
}

impl WebhookConfig {
    pub fn signer(&self) -> Result<Option<Signer>> {
        self.signing_secret
            .as_deref()
            .map(|secret| {
                Signer::from_secret(secret).ok_or_else(|| {
                    CarouselError::InvalidParameters(
                        "webhooks.signing_secret must be 'whsec_' followed by base64".to_string(),
                    )
                })
            })
            .transpose()
    }
}

// --- Channel types ---

/// A signed notification ready to send.
#[derive(Debug)]
struct WebhookSendRequest {
    url: String,
    headers: Vec<(String, String)>,
    body: String,
    job_id: JobId,
    sequence: i64,
    /// `batch.<status>` of the payload, for logging
    event_type: String,
}

impl WebhookSendRequest {
    /// Host of the receiver. Full URLs may carry tokens and are kept out of logs.
    fn host(&self) -> String {
        receiver_host(&self.url)
    }
}

fn receiver_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| "invalid-url".to_string())
}

/// Outcome of a single HTTP send attempt.
#[derive(Debug)]
enum SendOutcome {
    Success { status_code: u16 },
    Failure { status_code: Option<u16>, error: String },
}

impl From<SendOutcome> for DeliveryOutcome {
    fn from(outcome: SendOutcome) -> Self {
        match outcome {
            SendOutcome::Success { status_code } => DeliveryOutcome::Delivered { status_code },
            SendOutcome::Failure { status_code, error } => {
                DeliveryOutcome::Failed { status_code, error }
            }
        }
    }
}

/// Result of a webhook send attempt, sent back via the result channel.
#[derive(Debug)]
struct WebhookSendResult {
    job_id: JobId,
    sequence: i64,
    host: String,
    outcome: SendOutcome,
}

// --- Dispatcher ---

pub struct WebhookDispatcher<S: Storage> {
    storage: Arc<S>,
    send_tx: mpsc::Sender<WebhookSendRequest>,
    result_rx: mpsc::Receiver<WebhookSendResult>,
    signer: Option<Signer>,
    config: WebhookConfig,
}

impl<S: Storage + 'static> WebhookDispatcher<S> {
    /// Create a new dispatcher and spawn the background sender task.
    pub fn spawn(storage: Arc<S>, config: WebhookConfig, shutdown: CancellationToken) -> Result<Self> {
        let signer = config.signer()?;
        let (send_tx, send_rx) = mpsc::channel::<WebhookSendRequest>(config.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.channel_capacity);

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CarouselError::WebhookDelivery(format!("Failed to create HTTP client: {}", e)))?;

        tokio::spawn(run_sender(
            send_rx,
            result_tx,
            http_client,
            config.max_concurrent_sends,
            shutdown,
        ));

        Ok(Self {
            storage,
            send_tx,
            result_rx,
            signer,
            config,
        })
    }

    /// Run one dispatch cycle: claim → sign → send → process results.
    pub async fn tick(&mut self) {
        tracing::debug!("Webhook dispatcher tick");
        self.claim_and_send().await;
        self.drain_results().await;
    }

    /// Claim notifications that are due, sign them, and push to the sender channel.
    /// Returns how many were queued for sending.
    async fn claim_and_send(&self) -> usize {
        let now = Utc::now();
        let jobs = match self
            .storage
            .claim_due_webhooks(now, self.config.claim_batch_size, self.config.claim_lease)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim due webhooks");
                return 0;
            }
        };

        if jobs.is_empty() {
            return 0;
        }
        counter!("carousel_webhook_deliveries_claimed_total").increment(jobs.len() as u64);

        let mut queued = 0;
        for job in jobs {
            let Some(url) = job.webhook.url.clone() else {
                continue;
            };

            let payload = WebhookPayload::from_job(&job, now);
            let body = match serde_json::to_string(&payload) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to serialize webhook payload");
                    continue;
                }
            };

            let msg_id = payload.message_id();
            let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
            match &self.signer {
                Some(signer) => headers.extend(signer.headers(&msg_id, now.timestamp(), &body)),
                None => headers.push(("webhook-id".to_string(), msg_id)),
            }
            headers.push(("webhook-version".to_string(), "1".to_string()));

            let request = WebhookSendRequest {
                url,
                headers,
                body,
                job_id: job.id,
                sequence: payload.sequence,
                event_type: payload.event_type.clone(),
            };

            if let Err(e) = self.send_tx.try_send(request) {
                // The claim lease keeps it out of view until it expires
                tracing::warn!(job_id = %job.id, "Failed to push to sender channel (will retry after claim lease): {}", e);
            } else {
                queued += 1;
            }
        }
        queued
    }

    /// Drain completed send results and record them on the jobs.
    async fn drain_results(&mut self) {
        let mut drained = 0u32;
        while let Ok(result) = self.result_rx.try_recv() {
            drained += 1;
            self.record_result(result).await;
        }
        if drained > 0 {
            tracing::debug!(count = drained, "Drained webhook send results");
        }
    }

    async fn record_result(&self, result: WebhookSendResult) {
        let label = match result.outcome {
            SendOutcome::Success { .. } => "success",
            SendOutcome::Failure { .. } => "failure",
        };
        counter!("carousel_webhook_deliveries_total", "outcome" => label).increment(1);

        let attempt = WebhookAttempt {
            sequence: result.sequence,
            outcome: result.outcome.into(),
            attempted_at: Utc::now(),
        };
        match &attempt.outcome {
            DeliveryOutcome::Delivered { status_code } => tracing::debug!(
                job_id = %result.job_id,
                sequence = result.sequence,
                host = %result.host,
                status = status_code,
                "Webhook delivered"
            ),
            DeliveryOutcome::Failed { status_code, error } => tracing::warn!(
                job_id = %result.job_id,
                sequence = result.sequence,
                host = %result.host,
                status_code = ?status_code,
                error = %error,
                "Webhook delivery failed"
            ),
        }

        match self
            .storage
            .append_webhook_attempt(result.job_id, attempt, &self.config.retry)
            .await
        {
            Ok(job) if job.webhook.status == WebhookStatus::Failed => {
                counter!("carousel_webhook_exhausted_total").increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    attempts = job.webhook.attempts,
                    "Webhook retries exhausted, giving up"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %result.job_id, error = %e, "Failed to record webhook attempt");
            }
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(poll_interval = ?self.config.poll_interval, "Webhook dispatcher starting");
        let mut events = self.storage.subscribe();

        loop {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = events.recv() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Webhook dispatcher shutting down");
                    return Ok(());
                }
            }
        }
    }
}

// --- Sender task ---

/// Long-lived task that receives built requests and performs HTTP delivery.
async fn run_sender(
    mut rx: mpsc::Receiver<WebhookSendRequest>,
    result_tx: mpsc::Sender<WebhookSendResult>,
    http_client: reqwest::Client,
    max_concurrent_sends: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent_sends));

    loop {
        let request = tokio::select! {
            req = rx.recv() => {
                match req {
                    Some(r) => r,
                    None => {
                        tracing::debug!("Webhook sender channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("Webhook sender received shutdown signal");
                break;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("Webhook sender semaphore closed");
                break;
            }
        };

        let client = http_client.clone();
        let tx = result_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let job_id = request.job_id;
            let sequence = request.sequence;
            let host = request.host();

            let outcome = deliver(&client, request).await;
            if let SendOutcome::Failure { error, .. } = &outcome {
                tracing::debug!(job_id = %job_id, sequence, host = %host, error = %error, "Webhook send failed");
            }

            let result = WebhookSendResult {
                job_id,
                sequence,
                host,
                outcome,
            };
            if let Err(e) = tx.send(result).await {
                tracing::warn!(job_id = %job_id, sequence, "Dispatcher gone, dropping webhook result: {}", e);
            }
        });
    }

    tracing::debug!("Webhook sender task exited");
}

/// POST one notification. Any 2xx counts as delivered.
async fn deliver(client: &reqwest::Client, request: WebhookSendRequest) -> SendOutcome {
    tracing::debug!(
        job_id = %request.job_id,
        sequence = request.sequence,
        event_type = %request.event_type,
        host = %request.host(),
        "Posting batch notification"
    );

    let mut builder = client.post(&request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }

    match builder.body(request.body).send().await {
        Ok(response) if response.status().is_success() => SendOutcome::Success {
            status_code: response.status().as_u16(),
        },
        Ok(response) => {
            let status_code = response.status().as_u16();
            SendOutcome::Failure {
                status_code: Some(status_code),
                error: format!("HTTP {}", status_code),
            }
        }
        Err(e) if e.is_timeout() => SendOutcome::Failure {
            status_code: None,
            error: format!("receiver timed out: {}", e),
        },
        Err(e) if e.is_connect() => SendOutcome::Failure {
            status_code: None,
            error: format!("receiver unreachable: {}", e),
        },
        Err(e) => SendOutcome::Failure {
            status_code: None,
            error: e.to_string(),
        },
    }
}
