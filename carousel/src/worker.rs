//! Batch execution worker.
//!
//! The worker executes one granted job at a time: it streams the job's pending requests to the
//! resident model, records each outcome in storage, and moves the job on once everything has
//! resolved. Cancellation and external terminal transitions are observed between submissions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineError, EngineRequest, InferenceEngine};
use crate::error::{CarouselError, Result};
use crate::job::{BatchRequest, Job, JobId, JobStatus, RequestOutcome};
use crate::retry::RetryConfig;
use crate::storage::Storage;

/// Configuration for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Maximum number of requests of one job in flight at the engine
    pub max_concurrency: usize,
    /// Retry policy for transport faults
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            retry: RetryConfig::default(),
        }
    }
}

/// How a granted job left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Every request resolved; the job is now `finalizing`.
    Finalizing,
    /// A cancel request was honoured; the job is now `cancelled`.
    Cancelled,
    /// Something else made the job terminal mid-run (e.g. expiry).
    Stopped(JobStatus),
    /// Shutdown began before the job finished; it stays `in_progress` for restart recovery.
    Interrupted,
}

/// A job handed from the scheduler to the worker. The scheduler waits on `release`.
pub struct SlotGrant {
    pub job: Job,
    pub release: oneshot::Sender<Result<ExecutionOutcome>>,
}

/// Why submission stopped before every pending request was issued.
enum Halt {
    Cancel,
    Terminal(JobStatus),
    Shutdown,
}

pub struct Worker<S, E>
where
    S: Storage,
    E: InferenceEngine,
{
    storage: Arc<S>,
    engine: Arc<E>,
    config: WorkerConfig,
    requests_in_flight: Arc<AtomicUsize>,
}

impl<S, E> Worker<S, E>
where
    S: Storage + 'static,
    E: InferenceEngine,
{
    pub fn new(storage: Arc<S>, engine: Arc<E>, config: WorkerConfig) -> Self {
        Self {
            storage,
            engine,
            config,
            requests_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requests_in_flight(&self) -> usize {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    /// Receive grants from the scheduler and execute them until shutdown.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut grants: mpsc::Receiver<SlotGrant>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!("Worker starting");
        loop {
            let grant = tokio::select! {
                grant = grants.recv() => match grant {
                    Some(grant) => grant,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let result = self.execute(grant.job.id, &shutdown).await;
            if let Err(e) = &result {
                tracing::error!(job_id = %grant.job.id, error = %e, "Job execution failed");
            }
            // The scheduler may have stopped waiting during shutdown
            let _ = grant.release.send(result);
        }
        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Execute the pending requests of an `in_progress` job.
    #[tracing::instrument(skip(self, shutdown), fields(job_id = %job_id))]
    pub async fn execute(
        &self,
        job_id: JobId,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let pending = self.storage.pending_requests(job_id).await?;
        tracing::info!(pending = pending.len(), "Executing job");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut halt = None;

        for request in pending {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CarouselError::Other(e.into()))?;

            reap(&mut join_set);

            let job = self.storage.get_job(job_id).await?;
            if job.status.is_terminal() {
                halt = Some(Halt::Terminal(job.status));
                break;
            }
            if job.cancel_requested() {
                halt = Some(Halt::Cancel);
                break;
            }
            if shutdown.is_cancelled() {
                halt = Some(Halt::Shutdown);
                break;
            }

            let storage = self.storage.clone();
            let engine = self.engine.clone();
            let retry = self.config.retry;
            let requests_in_flight = self.requests_in_flight.clone();
            requests_in_flight.fetch_add(1, Ordering::Relaxed);

            join_set.spawn(async move {
                let _permit = permit;
                let _guard = scopeguard::guard((), |_| {
                    requests_in_flight.fetch_sub(1, Ordering::Relaxed);
                });

                let outcome = submit_with_retry(engine.as_ref(), &request, &retry).await;
                record(storage.as_ref(), job_id, &request.custom_id, outcome).await
            });
        }

        // In-flight requests always drain, whatever stopped submission
        while let Some(result) = join_set.join_next().await {
            log_task_result(result);
        }

        let job = self.storage.get_job(job_id).await?;
        if job.status.is_terminal() {
            tracing::info!(status = %job.status, "Job became terminal during execution");
            return Ok(ExecutionOutcome::Stopped(job.status));
        }
        if job.cancel_requested() || matches!(halt, Some(Halt::Cancel)) {
            self.storage.transition(job_id, JobStatus::Cancelled).await?;
            tracing::info!(
                completed = job.request_counts.completed,
                failed = job.request_counts.failed,
                "Job cancelled"
            );
            return Ok(ExecutionOutcome::Cancelled);
        }
        if job.request_counts.is_resolved() {
            self.storage.transition(job_id, JobStatus::Finalizing).await?;
            tracing::info!(
                completed = job.request_counts.completed,
                failed = job.request_counts.failed,
                "All requests resolved"
            );
            return Ok(ExecutionOutcome::Finalizing);
        }
        if matches!(halt, Some(Halt::Shutdown)) || shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, leaving job for recovery");
            return Ok(ExecutionOutcome::Interrupted);
        }
        if let Some(Halt::Terminal(status)) = halt {
            return Ok(ExecutionOutcome::Stopped(status));
        }

        Err(CarouselError::Other(anyhow::anyhow!(
            "Job {} still has {} unresolved requests",
            job_id,
            job.request_counts.total - job.request_counts.resolved()
        )))
    }
}

fn reap(join_set: &mut JoinSet<Result<()>>) {
    while let Some(result) = join_set.try_join_next() {
        log_task_result(result);
    }
}

fn log_task_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Request task failed"),
        Err(join_error) => tracing::error!(error = %join_error, "Request task panicked"),
    }
}

/// Submit one request, retrying transport faults with exponential backoff.
///
/// Model-level errors are final on the first attempt.
async fn submit_with_retry<E: InferenceEngine + ?Sized>(
    engine: &E,
    request: &BatchRequest,
    retry: &RetryConfig,
) -> RequestOutcome {
    let engine_request = EngineRequest {
        custom_id: request.custom_id.clone(),
        method: request.method.clone(),
        url: request.url.clone(),
        body: request.body.clone(),
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        match engine.submit(&engine_request).await {
            Ok(response) => {
                return RequestOutcome::Response {
                    status_code: response.status,
                    body: response.body,
                }
            }
            Err(EngineError::Model { message, .. }) => {
                return RequestOutcome::Error { message };
            }
            Err(EngineError::Transport(message)) => {
                if !retry.allows_retry(attempts) {
                    tracing::warn!(
                        custom_id = %request.custom_id,
                        attempts,
                        error = %message,
                        "Request failed permanently (no retries remaining)"
                    );
                    return RequestOutcome::Error {
                        message: format!("{} (after {} attempts)", message, attempts),
                    };
                }

                let backoff = retry.backoff(attempts - 1);
                metrics::counter!("carousel_request_retries_total").increment(1);
                tracing::debug!(
                    custom_id = %request.custom_id,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "Transport fault, retrying with exponential backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn record<S: Storage + ?Sized>(
    storage: &S,
    job_id: JobId,
    custom_id: &str,
    outcome: RequestOutcome,
) -> Result<()> {
    let label = if outcome.is_error() { "failed" } else { "completed" };
    match storage.record_result(job_id, custom_id, outcome).await {
        Ok(_) => {
            metrics::counter!("carousel_requests_total", "outcome" => label).increment(1);
            tracing::debug!(custom_id, outcome = label, "Recorded request outcome");
            Ok(())
        }
        // Already recorded by an earlier run, or the job ended underneath us
        Err(CarouselError::DuplicateResult { .. }) | Err(CarouselError::AlreadyTerminal { .. }) => {
            tracing::debug!(custom_id, "Outcome not recorded, request already settled");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
