//! Batch job and batch request types.
//!
//! A [`Job`] groups many independent [`BatchRequest`]s that share one target model and one
//! lifecycle. Status changes go through [`Job::apply_transition`] (see [`transitions`]) so
//! that every storage backend enforces the same state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryConfig;

pub mod transitions;

/// Opaque key/value mapping passed through untouched to handlers and webhooks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        JobId(uuid)
    }
}

impl std::ops::Deref for JobId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim_start_matches("batch_")).map(JobId)
    }
}

/// Lifecycle status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Validating,
    Queued,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Validating,
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Finalizing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Validating => "validating",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        }
    }

    /// Terminal jobs accept no further mutation of counts or requests.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown job status: {}", s))
    }
}

/// Per-job progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

impl RequestCounts {
    pub fn resolved(&self) -> i64 {
        self.completed + self.failed
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved() == self.total
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl From<&crate::error::CarouselError> for JobError {
    fn from(error: &crate::error::CarouselError) -> Self {
        let line = match error {
            crate::error::CarouselError::MalformedRequest { line, .. } => Some(*line),
            _ => None,
        };
        JobError {
            code: error.code().to_string(),
            message: error.to_string(),
            line,
        }
    }
}

/// Delivery state of a job's webhook notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    None,
    Pending,
    Delivered,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::None => "none",
            WebhookStatus::Pending => "pending",
            WebhookStatus::Delivered => "delivered",
            WebhookStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(WebhookStatus::None),
            "pending" => Ok(WebhookStatus::Pending),
            "delivered" => Ok(WebhookStatus::Delivered),
            "failed" => Ok(WebhookStatus::Failed),
            _ => Err(format!("Unknown webhook status: {}", s)),
        }
    }
}

/// Outcome of a single webhook POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        status_code: u16,
    },
    Failed {
        status_code: Option<u16>,
        error: String,
    },
}

/// A webhook attempt to append to a job's delivery history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookAttempt {
    /// The notification sequence number that was sent.
    pub sequence: i64,
    pub outcome: DeliveryOutcome,
    pub attempted_at: DateTime<Utc>,
}

/// Webhook bookkeeping carried on every job.
///
/// `sequence` is bumped on every status change and is included in the payload so receivers can
/// drop duplicates. The webhook stays `pending` until the newest sequence has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookState {
    pub url: Option<String>,
    pub status: WebhookStatus,
    pub attempts: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sequence: i64,
    pub delivered_sequence: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
}

impl WebhookState {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            status: WebhookStatus::None,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            sequence: 0,
            delivered_sequence: 0,
            next_attempt_at: None,
            consecutive_failures: 0,
        }
    }

    /// Queue a notification for the job's latest state.
    ///
    /// A webhook that exhausted its retries stays failed.
    pub fn notify(&mut self, now: DateTime<Utc>) {
        if self.url.is_none() || self.status == WebhookStatus::Failed {
            return;
        }
        self.sequence += 1;
        self.status = WebhookStatus::Pending;
        self.next_attempt_at = Some(now);
    }

    /// Fold the result of a delivery attempt into the state.
    pub fn record_attempt(&mut self, attempt: &WebhookAttempt, retry: &RetryConfig) {
        if self.status == WebhookStatus::Failed {
            return;
        }

        self.attempts += 1;
        self.last_attempt_at = Some(attempt.attempted_at);

        match &attempt.outcome {
            DeliveryOutcome::Delivered { .. } => {
                self.consecutive_failures = 0;
                self.delivered_sequence = self.delivered_sequence.max(attempt.sequence);
                if self.delivered_sequence >= self.sequence {
                    self.status = WebhookStatus::Delivered;
                    self.next_attempt_at = None;
                } else {
                    // A newer status change is still owed.
                    self.status = WebhookStatus::Pending;
                    self.next_attempt_at = Some(attempt.attempted_at);
                }
            }
            DeliveryOutcome::Failed { error, .. } => {
                self.consecutive_failures += 1;
                self.last_error = Some(error.clone());
                if self.consecutive_failures as u32 >= retry.max_attempts {
                    self.status = WebhookStatus::Failed;
                    self.next_attempt_at = None;
                } else {
                    let backoff = retry.backoff((self.consecutive_failures - 1) as u32);
                    let backoff = chrono::Duration::from_std(backoff)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    self.next_attempt_at = Some(attempt.attempted_at + backoff);
                }
            }
        }
    }
}

/// A batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub model: String,
    pub input_ref: String,
    pub output_ref: Option<String>,
    pub request_counts: RequestCounts,
    pub metadata: Metadata,
    pub completion_window: String,
    pub errors: Vec<JobError>,
    pub webhook: WebhookState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelling_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a new job in the `validating` state.
    ///
    /// `expires_at` is derived from the completion window; an unparsable window leaves the job
    /// without a deadline (admission rejects those before they get here).
    pub fn new(input: &JobInput, completion_window: String, total: i64) -> Self {
        let created_at = Utc::now();
        let expires_at = humantime::parse_duration(&completion_window)
            .ok()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| created_at.checked_add_signed(d));

        Self {
            id: JobId::new(),
            status: JobStatus::Validating,
            model: input.model.clone(),
            input_ref: input.input_ref.clone(),
            output_ref: None,
            request_counts: RequestCounts {
                total,
                completed: 0,
                failed: 0,
            },
            metadata: input.metadata.clone().unwrap_or_default(),
            completion_window,
            errors: Vec::new(),
            webhook: WebhookState::new(input.webhook_url.clone()),
            created_at,
            expires_at,
            started_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expired_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancelling_at.is_some()
    }
}

/// Parameters accepted by `create_job`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub input_ref: String,
    pub model: String,
    pub webhook_url: Option<String>,
    pub metadata: Option<Metadata>,
    pub completion_window: Option<String>,
}

impl JobInput {
    pub fn new(input_ref: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            input_ref: input_ref.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_completion_window(mut self, window: impl Into<String>) -> Self {
        self.completion_window = Some(window.into());
        self
    }
}

/// Final value of a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestOutcome {
    Response {
        status_code: u16,
        body: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl RequestOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, RequestOutcome::Error { .. })
    }
}

/// A single request inside a job. `outcome` is `None` while the request is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    /// 1-based line in the input collection.
    pub line: i64,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
    pub outcome: Option<RequestOutcome>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BatchRequest {
    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Filter parameters for listing jobs. Results are ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub model: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_statuses(statuses: impl Into<Vec<JobStatus>>) -> Self {
        Self {
            statuses: Some(statuses.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &job.model != model {
                return false;
            }
        }
        true
    }
}

/// Emitted by storage whenever a job changes status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}
