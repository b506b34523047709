//! PostgreSQL storage implementation.
//!
//! Every mutation runs in a transaction that takes a row lock on the job (`SELECT ... FOR
//! UPDATE`), applies the change through the same [`Job`] methods the in-memory store uses, and
//! writes the row back. Conflicting writers on one job are therefore serialised while readers are
//! never blocked.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{Storage, EVENT_BUFFER};
use crate::error::{CarouselError, Result};
use crate::job::{
    BatchRequest, Job, JobError, JobEvent, JobFilter, JobId, JobStatus, Metadata, RequestCounts,
    RequestOutcome, WebhookAttempt, WebhookState,
};
use crate::retry::RetryConfig;

/// Rows per multi-row insert; keeps binds well under the protocol limit.
const INSERT_CHUNK: usize = 5000;

/// Get the carousel database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    model: String,
    input_ref: String,
    output_ref: Option<String>,
    total_requests: i64,
    completed_requests: i64,
    failed_requests: i64,
    metadata: Json<Metadata>,
    completion_window: String,
    errors: Json<Vec<JobError>>,
    webhook_url: Option<String>,
    webhook_status: String,
    webhook_attempts: i32,
    webhook_last_attempt: Option<DateTime<Utc>>,
    webhook_last_error: Option<String>,
    webhook_sequence: i64,
    webhook_delivered_sequence: i64,
    webhook_next_attempt_at: Option<DateTime<Utc>>,
    webhook_consecutive_failures: i32,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finalizing_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    cancelling_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = CarouselError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: JobId(row.id),
            status: row
                .status
                .parse()
                .map_err(|e: String| CarouselError::Other(anyhow!(e)))?,
            model: row.model,
            input_ref: row.input_ref,
            output_ref: row.output_ref,
            request_counts: RequestCounts {
                total: row.total_requests,
                completed: row.completed_requests,
                failed: row.failed_requests,
            },
            metadata: row.metadata.0,
            completion_window: row.completion_window,
            errors: row.errors.0,
            webhook: WebhookState {
                url: row.webhook_url,
                status: row
                    .webhook_status
                    .parse()
                    .map_err(|e: String| CarouselError::Other(anyhow!(e)))?,
                attempts: row.webhook_attempts,
                last_attempt_at: row.webhook_last_attempt,
                last_error: row.webhook_last_error,
                sequence: row.webhook_sequence,
                delivered_sequence: row.webhook_delivered_sequence,
                next_attempt_at: row.webhook_next_attempt_at,
                consecutive_failures: row.webhook_consecutive_failures,
            },
            created_at: row.created_at,
            expires_at: row.expires_at,
            started_at: row.started_at,
            finalizing_at: row.finalizing_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            cancelling_at: row.cancelling_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    custom_id: String,
    line: i64,
    method: String,
    url: String,
    body: serde_json::Value,
    outcome: Option<Json<RequestOutcome>>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<RequestRow> for BatchRequest {
    fn from(row: RequestRow) -> Self {
        BatchRequest {
            custom_id: row.custom_id,
            line: row.line,
            method: row.method,
            url: row.url,
            body: row.body,
            outcome: row.outcome.map(|o| o.0),
            resolved_at: row.resolved_at,
        }
    }
}

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    events: broadcast::Sender<JobEvent>,
}

impl PostgresStorage {
    /// Create a new PostgresStorage instance with the given connection pool.
    ///
    /// # Example
    /// ```ignore
    /// let pool = PgPool::connect("postgresql://localhost/carousel").await?;
    /// let storage = PostgresStorage::new(pool);
    /// ```
    pub fn new(pool: PgPool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { pool, events }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        migrator()
            .run(&self.pool)
            .await
            .map_err(|e| CarouselError::Other(anyhow!("Failed to run migrations: {}", e)))
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn lock_job(conn: &mut PgConnection, job_id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM batch_jobs WHERE id = $1 FOR UPDATE")
                .bind(*job_id)
                .fetch_optional(&mut *conn)
                .await?;
        row.ok_or(CarouselError::JobNotFound(job_id))?.try_into()
    }

    async fn save_job(conn: &mut PgConnection, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batch_jobs SET
                status = $2,
                output_ref = $3,
                completed_requests = $4,
                failed_requests = $5,
                errors = $6,
                webhook_status = $7,
                webhook_attempts = $8,
                webhook_last_attempt = $9,
                webhook_last_error = $10,
                webhook_sequence = $11,
                webhook_delivered_sequence = $12,
                webhook_next_attempt_at = $13,
                webhook_consecutive_failures = $14,
                started_at = $15,
                finalizing_at = $16,
                completed_at = $17,
                failed_at = $18,
                cancelling_at = $19,
                cancelled_at = $20,
                expired_at = $21
            WHERE id = $1
            "#,
        )
        .bind(*job.id)
        .bind(job.status.as_str())
        .bind(&job.output_ref)
        .bind(job.request_counts.completed)
        .bind(job.request_counts.failed)
        .bind(Json(&job.errors))
        .bind(job.webhook.status.as_str())
        .bind(job.webhook.attempts)
        .bind(job.webhook.last_attempt_at)
        .bind(&job.webhook.last_error)
        .bind(job.webhook.sequence)
        .bind(job.webhook.delivered_sequence)
        .bind(job.webhook.next_attempt_at)
        .bind(job.webhook.consecutive_failures)
        .bind(job.started_at)
        .bind(job.finalizing_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.cancelling_at)
        .bind(job.cancelled_at)
        .bind(job.expired_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Lock a job, mutate it in Rust, and write it back in one transaction.
    async fn mutate_job<F>(&self, job_id: JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<Option<JobEvent>> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let event = f(&mut job)?;
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await?;

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(job)
    }

    async fn fetch_requests(&self, job_id: JobId, pending_only: bool) -> Result<Vec<BatchRequest>> {
        // Distinguish an unknown job from one with no matching requests
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM batch_jobs WHERE id = $1")
            .bind(*job_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(CarouselError::JobNotFound(job_id));
        }

        let rows: Vec<RequestRow> = sqlx::query_as(
            r#"
            SELECT custom_id, line, method, url, body, outcome, resolved_at
            FROM batch_requests
            WHERE job_id = $1 AND ($2 = FALSE OR outcome IS NULL)
            ORDER BY line ASC
            "#,
        )
        .bind(*job_id)
        .bind(pending_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BatchRequest::from).collect())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self, job, requests), fields(job_id = %job.id, total = requests.len()))]
    async fn create_job(&self, job: Job, requests: Vec<BatchRequest>) -> Result<JobId> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                id, status, model, input_ref, output_ref,
                total_requests, completed_requests, failed_requests,
                metadata, completion_window, errors,
                webhook_url, webhook_status, webhook_sequence, webhook_next_attempt_at,
                created_at, expires_at, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(*job.id)
        .bind(job.status.as_str())
        .bind(&job.model)
        .bind(&job.input_ref)
        .bind(&job.output_ref)
        .bind(job.request_counts.total)
        .bind(job.request_counts.completed)
        .bind(job.request_counts.failed)
        .bind(Json(&job.metadata))
        .bind(&job.completion_window)
        .bind(Json(&job.errors))
        .bind(&job.webhook.url)
        .bind(job.webhook.status.as_str())
        .bind(job.webhook.sequence)
        .bind(job.webhook.next_attempt_at)
        .bind(job.created_at)
        .bind(job.expires_at)
        .bind(job.failed_at)
        .execute(&mut *tx)
        .await?;

        for chunk in requests.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO batch_requests (job_id, custom_id, line, method, url, body) ",
            );
            builder.push_values(chunk, |mut row, request| {
                row.push_bind(*job.id)
                    .push_bind(&request.custom_id)
                    .push_bind(request.line)
                    .push_bind(&request.method)
                    .push_bind(&request.url)
                    .push_bind(Json(&request.body));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(job.id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM batch_jobs WHERE id = $1")
            .bind(*job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(CarouselError::JobNotFound(job_id))?.try_into()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM batch_jobs WHERE TRUE");
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(model) = &filter.model {
            builder.push(" AND model = ").push_bind(model);
        }
        builder.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<JobRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    #[tracing::instrument(skip(self, outcome), fields(job_id = %job_id))]
    async fn record_result(
        &self,
        job_id: JobId,
        custom_id: &str,
        outcome: RequestOutcome,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if job.status.is_terminal() {
            return Err(CarouselError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }

        let is_error = outcome.is_error();
        let updated = sqlx::query(
            r#"
            UPDATE batch_requests
            SET outcome = $3, resolved_at = NOW()
            WHERE job_id = $1 AND custom_id = $2 AND outcome IS NULL
            "#,
        )
        .bind(*job_id)
        .bind(custom_id)
        .bind(Json(&outcome))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<String> = sqlx::query_scalar(
                "SELECT custom_id FROM batch_requests WHERE job_id = $1 AND custom_id = $2",
            )
            .bind(*job_id)
            .bind(custom_id)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match exists {
                Some(_) => CarouselError::DuplicateResult {
                    job_id,
                    custom_id: custom_id.to_string(),
                },
                None => CarouselError::RequestNotFound {
                    job_id,
                    custom_id: custom_id.to_string(),
                },
            });
        }

        if is_error {
            job.request_counts.failed += 1;
        } else {
            job.request_counts.completed += 1;
        }
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    #[tracing::instrument(skip(self), fields(job_id = %job_id, to = %to))]
    async fn transition(&self, job_id: JobId, to: JobStatus) -> Result<Job> {
        self.mutate_job(job_id, |job| job.apply_transition(to, Utc::now()).map(Some))
            .await
    }

    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        self.mutate_job(job_id, |job| job.cancel(Utc::now())).await
    }

    async fn pending_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>> {
        self.fetch_requests(job_id, true).await
    }

    async fn job_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>> {
        self.fetch_requests(job_id, false).await
    }

    async fn set_output_ref(&self, job_id: JobId, output_ref: &str) -> Result<Job> {
        let output_ref = output_ref.to_string();
        self.mutate_job(job_id, move |job| {
            job.output_ref = Some(output_ref);
            Ok(None)
        })
        .await
    }

    async fn append_errors(&self, job_id: JobId, errors: Vec<JobError>) -> Result<Job> {
        self.mutate_job(job_id, move |job| {
            job.errors.extend(errors);
            Ok(None)
        })
        .await
    }

    async fn claim_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: std::time::Duration,
    ) -> Result<Vec<Job>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CarouselError::Other(anyhow!("Invalid lease: {}", e)))?;

        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            UPDATE batch_jobs
            SET webhook_next_attempt_at = $2
            WHERE id IN (
                SELECT id
                FROM batch_jobs
                WHERE webhook_status = 'pending'
                    AND webhook_next_attempt_at <= $1
                ORDER BY webhook_next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn append_webhook_attempt(
        &self,
        job_id: JobId,
        attempt: WebhookAttempt,
        retry: &RetryConfig,
    ) -> Result<Job> {
        let retry = *retry;
        self.mutate_job(job_id, move |job| {
            job.webhook.record_attempt(&attempt, &retry);
            Ok(None)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn recover_interrupted(&self) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<JobRow> =
            sqlx::query_as(
                "SELECT * FROM batch_jobs WHERE status IN ('in_progress', 'validating') FOR UPDATE",
            )
                .fetch_all(&mut *tx)
                .await?;

        let now = Utc::now();
        let mut recovered = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Job::try_from(row)?;
            if let Some(event) = job.recover(now) {
                Self::save_job(&mut tx, &job).await?;
                events.push(event);
                recovered.push(job);
            }
        }
        tx.commit().await?;

        for event in events {
            self.emit(event);
        }
        Ok(recovered)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
