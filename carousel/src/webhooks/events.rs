//! Webhook payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobError, JobId, JobStatus, Metadata, RequestCounts};

/// Event type for a status, e.g. `batch.completed`.
pub fn event_type(status: JobStatus) -> String {
    format!("batch.{}", status)
}

/// Body posted to a job's webhook URL.
///
/// Always carries the job's full current state, so a receiver that sees a notification twice,
/// or out of order, can keep the one with the highest `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: JobId,
    pub status: JobStatus,
    pub model: String,
    pub request_counts: RequestCounts,
    pub output_ref: Option<String>,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
    pub created_at: DateTime<Utc>,
    /// Per-job notification number, bumped on every status change
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn from_job(job: &Job, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type(job.status),
            id: job.id,
            status: job.status,
            model: job.model.clone(),
            request_counts: job.request_counts,
            output_ref: job.output_ref.clone(),
            metadata: job.metadata.clone(),
            errors: job.errors.clone(),
            created_at: job.created_at,
            sequence: job.webhook.sequence,
            timestamp,
        }
    }

    /// Stable message id: retries of the same notification share it.
    pub fn message_id(&self) -> String {
        format!("{}_{}", self.id, self.sequence)
    }
}
