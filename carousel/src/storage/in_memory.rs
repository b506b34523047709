//! In-memory storage implementation.
//!
//! Suitable for tests and single-process deployments where losing jobs on restart is acceptable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{Storage, EVENT_BUFFER};
use crate::error::{CarouselError, Result};
use crate::job::{
    BatchRequest, Job, JobError, JobEvent, JobFilter, JobId, JobStatus, RequestOutcome,
    WebhookAttempt, WebhookStatus,
};
use crate::retry::RetryConfig;

/// A job together with its requests, indexed by custom_id.
#[derive(Clone)]
struct StoredJob {
    job: Job,
    requests: Vec<BatchRequest>,
    by_custom_id: HashMap<String, usize>,
}

/// In-memory implementation of the Storage trait.
///
/// A single write lock serialises all mutations, which trivially gives per-job serialisation.
#[derive(Clone)]
pub struct InMemoryStorage {
    jobs: Arc<RwLock<HashMap<JobId, StoredJob>>>,
    events: broadcast::Sender<JobEvent>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn emit(&self, event: JobEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Run `f` against a job under the write lock.
    fn with_job<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut StoredJob) -> Result<T>,
    ) -> Result<T> {
        let mut jobs = self.jobs.write();
        let stored = jobs
            .get_mut(&job_id)
            .ok_or(CarouselError::JobNotFound(job_id))?;
        f(stored)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_job(&self, job: Job, mut requests: Vec<BatchRequest>) -> Result<JobId> {
        let job_id = job.id;
        requests.sort_by_key(|r| r.line);
        let by_custom_id = requests
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.custom_id.clone(), idx))
            .collect();

        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job_id) {
            return Err(CarouselError::Other(anyhow::anyhow!(
                "Job {} already exists",
                job_id
            )));
        }
        jobs.insert(
            job_id,
            StoredJob {
                job,
                requests,
                by_custom_id,
            },
        );
        Ok(job_id)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(&job_id)
            .map(|stored| stored.job.clone())
            .ok_or(CarouselError::JobNotFound(job_id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|stored| filter.matches(&stored.job))
            .map(|stored| stored.job.clone())
            .collect();
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn record_result(
        &self,
        job_id: JobId,
        custom_id: &str,
        outcome: RequestOutcome,
    ) -> Result<Job> {
        self.with_job(job_id, |stored| {
            if stored.job.status.is_terminal() {
                return Err(CarouselError::AlreadyTerminal {
                    job_id,
                    status: stored.job.status,
                });
            }
            let idx = *stored.by_custom_id.get(custom_id).ok_or_else(|| {
                CarouselError::RequestNotFound {
                    job_id,
                    custom_id: custom_id.to_string(),
                }
            })?;
            let request = &mut stored.requests[idx];
            if !request.is_pending() {
                return Err(CarouselError::DuplicateResult {
                    job_id,
                    custom_id: custom_id.to_string(),
                });
            }

            if outcome.is_error() {
                stored.job.request_counts.failed += 1;
            } else {
                stored.job.request_counts.completed += 1;
            }
            request.outcome = Some(outcome);
            request.resolved_at = Some(Utc::now());
            Ok(stored.job.clone())
        })
    }

    async fn transition(&self, job_id: JobId, to: JobStatus) -> Result<Job> {
        let (job, event) = self.with_job(job_id, |stored| {
            let event = stored.job.apply_transition(to, Utc::now())?;
            Ok((stored.job.clone(), event))
        })?;
        self.emit(event);
        Ok(job)
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let (job, event) = self.with_job(job_id, |stored| {
            let event = stored.job.cancel(Utc::now())?;
            Ok((stored.job.clone(), event))
        })?;
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(job)
    }

    async fn pending_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>> {
        self.with_job(job_id, |stored| {
            Ok(stored
                .requests
                .iter()
                .filter(|r| r.is_pending())
                .cloned()
                .collect())
        })
    }

    async fn job_requests(&self, job_id: JobId) -> Result<Vec<BatchRequest>> {
        self.with_job(job_id, |stored| Ok(stored.requests.clone()))
    }

    async fn set_output_ref(&self, job_id: JobId, output_ref: &str) -> Result<Job> {
        self.with_job(job_id, |stored| {
            stored.job.output_ref = Some(output_ref.to_string());
            Ok(stored.job.clone())
        })
    }

    async fn append_errors(&self, job_id: JobId, errors: Vec<JobError>) -> Result<Job> {
        self.with_job(job_id, |stored| {
            stored.job.errors.extend(errors);
            Ok(stored.job.clone())
        })
    }

    async fn claim_due_webhooks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: std::time::Duration,
    ) -> Result<Vec<Job>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CarouselError::Other(anyhow::anyhow!("Invalid lease: {}", e)))?;

        let mut jobs = self.jobs.write();
        let mut due: Vec<&mut StoredJob> = jobs
            .values_mut()
            .filter(|stored| {
                stored.job.webhook.status == WebhookStatus::Pending
                    && stored
                        .job
                        .webhook
                        .next_attempt_at
                        .is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|stored| stored.job.webhook.next_attempt_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|stored| {
                stored.job.webhook.next_attempt_at = Some(now + lease);
                stored.job.clone()
            })
            .collect())
    }

    async fn append_webhook_attempt(
        &self,
        job_id: JobId,
        attempt: WebhookAttempt,
        retry: &RetryConfig,
    ) -> Result<Job> {
        self.with_job(job_id, |stored| {
            stored.job.webhook.record_attempt(&attempt, retry);
            Ok(stored.job.clone())
        })
    }

    async fn recover_interrupted(&self) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        let mut events = Vec::new();
        {
            let mut jobs = self.jobs.write();
            for stored in jobs.values_mut() {
                if let Some(event) = stored.job.recover(now) {
                    events.push(event);
                    recovered.push(stored.job.clone());
                }
            }
        }
        for event in events {
            self.emit(event);
        }
        Ok(recovered)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
