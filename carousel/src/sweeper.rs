//! Expiry sweeper.
//!
//! Jobs still `queued` or `in_progress` past their `expires_at` are moved to `expired`. An
//! expired in-progress job is noticed by the worker between submissions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CarouselError, Result};
use crate::job::{JobFilter, JobId, JobStatus};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpiryConfig {
    /// How often to look for expired jobs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Expire every queued or in-progress job whose deadline is at or before `now`.
pub async fn sweep_expired<S: Storage + ?Sized>(storage: &S, now: DateTime<Utc>) -> Result<Vec<JobId>> {
    let candidates = storage
        .list_jobs(&JobFilter::with_statuses([
            JobStatus::Queued,
            JobStatus::InProgress,
        ]))
        .await?;

    let mut expired = Vec::new();
    for job in candidates.into_iter().filter(|job| job.is_expired(now)) {
        match storage.transition(job.id, JobStatus::Expired).await {
            Ok(_) => {
                metrics::counter!("carousel_jobs_expired_total").increment(1);
                tracing::info!(job_id = %job.id, expires_at = ?job.expires_at, "Job expired");
                expired.push(job.id);
            }
            // Finished or cancelled since we listed it
            Err(CarouselError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

pub struct ExpirySweeper<S: Storage> {
    storage: Arc<S>,
    config: ExpiryConfig,
}

impl<S: Storage + 'static> ExpirySweeper<S> {
    pub fn new(storage: Arc<S>, config: ExpiryConfig) -> Self {
        Self { storage, config }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(interval = ?self.config.sweep_interval, "Expiry sweeper starting");
        loop {
            if let Err(e) = sweep_expired(self.storage.as_ref(), Utc::now()).await {
                tracing::error!(error = %e, "Expiry sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Expiry sweeper shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{queued_job, sample_job};
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_sweeps_only_overdue_active_jobs() {
        let storage = InMemoryStorage::new();
        let overdue = queued_job(&storage, "m", 1).await;
        let running = queued_job(&storage, "m", 1).await;
        storage.transition(running.id, JobStatus::InProgress).await.unwrap();
        let fresh = queued_job(&storage, "m", 1).await;
        let (validating, requests) = sample_job("m", 1);
        storage.create_job(validating.clone(), requests).await.unwrap();

        // Everything above expires 24h after creation
        let later = Utc::now() + chrono::Duration::hours(25);
        let soon = Utc::now() + chrono::Duration::hours(1);

        assert!(sweep_expired(&storage, soon).await.unwrap().is_empty());

        let mut expired = sweep_expired(&storage, later).await.unwrap();
        expired.sort();
        let mut expected = vec![overdue.id, running.id, fresh.id];
        expected.sort();
        assert_eq!(expired, expected);

        let job = storage.get_job(running.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Expired);
        assert!(job.expired_at.is_some());
        let job = storage.get_job(validating.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Validating);
    }
}
