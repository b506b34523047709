//! Job and request state store.
//!
//! The store is the single source of truth for job state. Every mutation is durable before the
//! call returns, and status changes are validated against the job state machine, so the loops
//! that drive jobs can be restarted at any point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::job::{
    BatchRequest, Job, JobError, JobEvent, JobFilter, JobId, JobStatus, RequestOutcome,
    WebhookAttempt,
};
use crate::retry::RetryConfig;

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

/// Capacity of the job event broadcast channel.
pub(crate) const EVENT_BUFFER: usize = 1024;

/// Storage trait for persisting and querying batch jobs and their requests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new job together with all of its requests, atomically.
    async fn create_job(&self, job: Job, requests: Vec<BatchRequest>) -> Result<JobId>;

    /// Get a job by ID.
    ///
    /// # Errors
    /// - `JobNotFound` if no such job exists
    async fn get_job(&self, job_id: JobId) -> Result<Job>;

    /// List jobs matching the filter, oldest admission first (ties broken by id).
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Record the outcome of one request and bump the matching counter.
    ///
    /// # Errors
    /// - `DuplicateResult` if the request is already resolved; counters are untouched
    /// - `AlreadyTerminal` if the job is terminal
    /// - `RequestNotFound` if the job has no such request
    async fn record_result(
        &self,
        job_id: JobId,
        custom_id: &str,
        outcome: RequestOutcome,
    ) -> Result<Job>;

    /// Move a job to a new status.
    ///
    /// # Errors
    /// - `InvalidTransition` on an edge outside the state machine or a failed guard
    async fn transition(&self, job_id: JobId, to: JobStatus) -> Result<Job>;

    /// Cancel a job, deciding on its current status under the job's write lock.
    ///
    /// A `queued` job moves to `cancelled`. An `in_progress` job is flagged for cooperative
    /// cancellation (idempotent); the worker performs the transition once in-flight requests
    /// drain.
    ///
    /// # Errors
    /// - `AlreadyTerminal` if the job is terminal or otherwise past the point of cancelling
    async fn cancel(&self, job_id: JobId) -> Result<Job>;

    /// Requests of a job that have no outcome yet, in input order.
    async fn pending_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>>;

    /// All requests of a job, in input order.
    async fn job_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>>;

    /// Set the reference to the persisted result collection.
    async fn set_output_ref(&self, job_id: JobId, output_ref: &str) -> Result<Job>;

    /// Append errors explaining why a job failed.
    async fn append_errors(&self, job_id: JobId, errors: Vec<JobError>) -> Result<Job>;

    /// Claim jobs whose webhook is pending and due at `now`.
    ///
    /// Claimed jobs have `webhook.next_attempt_at` pushed to `now + lease` so a delivery that is
    /// still in flight is not claimed again; if the process dies mid-send the lease expires and
    /// the notification is retried.
    async fn claim_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: std::time::Duration,
    ) -> Result<Vec<Job>>;

    /// Append the result of a webhook delivery attempt.
    async fn append_webhook_attempt(
        &self,
        job_id: JobId,
        attempt: WebhookAttempt,
        retry: &RetryConfig,
    ) -> Result<Job>;

    /// Resume jobs left mid-flight by a previous process.
    ///
    /// `in_progress` jobs go back to `queued` (or to `cancelled` if a cancel had been requested);
    /// their resolved requests are kept so only pending ones are executed again. Jobs stuck in
    /// `validating` are queued if their requests were persisted and failed otherwise.
    async fn recover_interrupted(&self) -> Result<Vec<Job>>;

    /// Subscribe to status change events.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}
