//! Finalizer: turns `finalizing` jobs into `completed` ones.
//!
//! For each finalizing job the result collection is written to blob storage, the result
//! handlers run, and the job transitions to `completed` whatever the handlers reported. The
//! finalizer polls storage, so a finalization interrupted by a crash is picked up again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::error::{CarouselError, Result};
use crate::handlers::{HandlerRegistry, HandlerReport};
use crate::job::{JobFilter, JobId, JobStatus};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinalizerConfig {
    /// Fallback polling interval when no job events arrive
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct Finalizer<S, B>
where
    S: Storage,
    B: BlobStore,
{
    storage: Arc<S>,
    blobs: Arc<B>,
    handlers: HandlerRegistry,
    config: FinalizerConfig,
}

impl<S, B> Finalizer<S, B>
where
    S: Storage + 'static,
    B: BlobStore,
{
    pub fn new(
        storage: Arc<S>,
        blobs: Arc<B>,
        handlers: HandlerRegistry,
        config: FinalizerConfig,
    ) -> Self {
        Self {
            storage,
            blobs,
            handlers,
            config,
        }
    }

    /// Finalize one job.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn finalize(&self, job_id: JobId) -> Result<HandlerReport> {
        let job = self.storage.get_job(job_id).await?;
        if job.status != JobStatus::Finalizing {
            return Err(CarouselError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Completed,
            });
        }

        let requests = self.storage.job_requests(job_id).await?;

        // A previous attempt may already have written the results
        let output_ref = match job.output_ref {
            Some(output_ref) => output_ref,
            None => {
                let output_ref = self.blobs.write_results(job_id, &requests).await?;
                self.storage.set_output_ref(job_id, &output_ref).await?;
                output_ref
            }
        };

        let report = self.handlers.run(job_id, &requests, &job.metadata).await;
        self.storage.transition(job_id, JobStatus::Completed).await?;

        metrics::counter!("carousel_jobs_completed_total").increment(1);
        tracing::info!(
            output_ref = %output_ref,
            completed = job.request_counts.completed,
            failed = job.request_counts.failed,
            handler_failures = report.failed().count(),
            "Job completed"
        );
        Ok(report)
    }

    /// Finalize every job currently in `finalizing`. Returns how many completed.
    pub async fn tick(&self) -> Result<usize> {
        let jobs = self
            .storage
            .list_jobs(&JobFilter::with_statuses([JobStatus::Finalizing]))
            .await?;

        let mut completed = 0;
        for job in jobs {
            match self.finalize(job.id).await {
                Ok(_) => completed += 1,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to finalize job, will retry");
                }
            }
        }
        Ok(completed)
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(poll_interval = ?self.config.poll_interval, "Finalizer starting");
        let mut events = self.storage.subscribe();

        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Finalizer tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                event = events.recv() => {
                    if let Ok(event) = event {
                        tracing::trace!(job_id = %event.job_id, to = %event.to, "Finalizer woke on job event");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Finalizer shutting down");
                    return Ok(());
                }
            }
        }
    }
}
