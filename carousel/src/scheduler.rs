//! Model hot-swap scheduler.
//!
//! The engine can hold one model at a time, so the scheduler serialises jobs: it takes the
//! oldest `queued` job, makes sure that job's model is resident (unloading and loading as
//! needed), moves it to `in_progress` and hands it to the worker, then waits for the worker to
//! release it before granting anything else.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineError, InferenceEngine};
use crate::error::{CarouselError, Result};
use crate::job::{Job, JobError, JobFilter, JobId, JobStatus};
use crate::storage::Storage;
use crate::sweeper::sweep_expired;
use crate::worker::{ExecutionOutcome, SlotGrant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Fallback polling interval when no job events arrive
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of the engine's single model slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "model", rename_all = "snake_case")]
pub enum ModelResidency {
    #[default]
    None,
    Loading(String),
    Resident(String),
    Unloading(String),
}

impl ModelResidency {
    /// The model that is loaded and serving, if any.
    pub fn resident(&self) -> Option<&str> {
        match self {
            ModelResidency::Resident(model) => Some(model),
            _ => None,
        }
    }
}

/// FIFO of queued jobs: oldest admission first, ties broken by id.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn from_jobs(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Self { jobs: jobs.into() }
    }

    /// Rebuild the queue from storage.
    pub async fn load<S: Storage + ?Sized>(storage: &S) -> Result<Self> {
        let jobs = storage
            .list_jobs(&JobFilter::with_statuses([JobStatus::Queued]))
            .await?;
        Ok(Self::from_jobs(jobs))
    }

    pub fn peek(&self) -> Option<&Job> {
        self.jobs.front()
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Result of one scheduling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing queued.
    Idle,
    /// A job ran on the worker and was released.
    Executed {
        job_id: JobId,
        outcome: ExecutionOutcome,
    },
    /// The head job's model failed to load; the job is now `failed`.
    LoadFailed(JobId),
    /// The head job changed state before it could be granted.
    Skipped(JobId),
    /// The worker failed; the job was put back in the queue.
    Requeued(JobId),
}

pub struct Scheduler<S, E>
where
    S: Storage,
    E: InferenceEngine,
{
    storage: Arc<S>,
    engine: Arc<E>,
    grants: mpsc::Sender<SlotGrant>,
    residency: RwLock<ModelResidency>,
    config: SchedulerConfig,
}

impl<S, E> Scheduler<S, E>
where
    S: Storage + 'static,
    E: InferenceEngine,
{
    pub fn new(
        storage: Arc<S>,
        engine: Arc<E>,
        grants: mpsc::Sender<SlotGrant>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            engine,
            grants,
            residency: RwLock::new(ModelResidency::None),
            config,
        }
    }

    pub fn resident_model(&self) -> Option<String> {
        self.residency.read().resident().map(str::to_owned)
    }

    /// Schedule until shutdown, waking on job events or the poll interval.
    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(poll_interval = ?self.config.poll_interval, "Scheduler starting");
        let mut events = self.storage.subscribe();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(TickOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        event = events.recv() => {
                            if let Err(broadcast::error::RecvError::Lagged(skipped)) = event {
                                tracing::debug!(skipped, "Scheduler lagged behind job events");
                            }
                        }
                        _ = shutdown.cancelled() => break,
                    }
                }
                Ok(outcome) => {
                    tracing::debug!(?outcome, "Scheduler tick finished");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler tick failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// One scheduling step: sweep expiry, pick the queue head, swap if needed, grant, wait.
    pub async fn tick(&self) -> Result<TickOutcome> {
        sweep_expired(self.storage.as_ref(), Utc::now()).await?;

        let queue = JobQueue::load(self.storage.as_ref()).await?;
        let Some(head) = queue.peek() else {
            return Ok(TickOutcome::Idle);
        };
        let job_id = head.id;
        let model = head.model.clone();

        if self.resident_model().as_deref() != Some(model.as_str()) {
            if let Err(e) = self.swap_to(&model).await {
                return self.fail_load(job_id, &model, e).await;
            }
        }

        let job = match self.storage.transition(job_id, JobStatus::InProgress).await {
            Ok(job) => job,
            Err(CarouselError::InvalidTransition { from, .. }) => {
                tracing::debug!(job_id = %job_id, status = %from, "Queue head changed before grant");
                return Ok(TickOutcome::Skipped(job_id));
            }
            Err(e) => return Err(e),
        };

        tracing::info!(job_id = %job_id, model = %model, total = job.request_counts.total, "Granting worker slot");
        let (release_tx, release_rx) = oneshot::channel();
        self.grants
            .send(SlotGrant {
                job,
                release: release_tx,
            })
            .await
            .map_err(|_| CarouselError::Other(anyhow::anyhow!("Worker is not running")))?;

        match release_rx.await {
            Ok(Ok(outcome)) => {
                tracing::info!(job_id = %job_id, ?outcome, "Worker released slot");
                Ok(TickOutcome::Executed { job_id, outcome })
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Worker failed, requeueing job");
                self.storage.recover_interrupted().await?;
                Ok(TickOutcome::Requeued(job_id))
            }
            // Worker exited without answering (shutdown); restart recovery picks the job up
            Err(_) => Ok(TickOutcome::Executed {
                job_id,
                outcome: ExecutionOutcome::Interrupted,
            }),
        }
    }

    /// Replace the resident model with `model`. Unload failures are only logged.
    #[tracing::instrument(skip(self))]
    async fn swap_to(&self, model: &str) -> std::result::Result<(), EngineError> {
        let current = self.residency.read().clone();
        if let ModelResidency::Resident(old) = current {
            tracing::info!(from = %old, to = %model, "Swapping models");
            *self.residency.write() = ModelResidency::Unloading(old.clone());
            if let Err(e) = self.engine.unload_model().await {
                tracing::warn!(model = %old, error = %e, "Failed to unload model");
            }
            *self.residency.write() = ModelResidency::None;
        }

        *self.residency.write() = ModelResidency::Loading(model.to_string());
        match self.engine.load_model(model).await {
            Ok(()) => {
                *self.residency.write() = ModelResidency::Resident(model.to_string());
                metrics::counter!("carousel_model_swaps_total").increment(1);
                tracing::info!(model, "Model resident");
                Ok(())
            }
            Err(e) => {
                *self.residency.write() = ModelResidency::None;
                metrics::counter!("carousel_model_load_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn fail_load(&self, job_id: JobId, model: &str, e: EngineError) -> Result<TickOutcome> {
        let error = CarouselError::ModelLoad {
            model: model.to_string(),
            message: e.to_string(),
        };
        tracing::error!(job_id = %job_id, model, error = %error, "Model load failed, failing job");

        self.storage
            .append_errors(job_id, vec![JobError::from(&error)])
            .await?;
        match self.storage.transition(job_id, JobStatus::Failed).await {
            Ok(_) => Ok(TickOutcome::LoadFailed(job_id)),
            Err(CarouselError::InvalidTransition { .. }) => Ok(TickOutcome::Skipped(job_id)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, MockEngine};
    use crate::storage::tests::queued_job;
    use crate::storage::InMemoryStorage;
    use crate::worker::{Worker, WorkerConfig};

    struct Harness {
        storage: Arc<InMemoryStorage>,
        engine: Arc<MockEngine>,
        scheduler: Scheduler<InMemoryStorage, MockEngine>,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = Arc::new(MockEngine::new());
        let (grants_tx, grants_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let worker = Arc::new(Worker::new(
            storage.clone(),
            engine.clone(),
            WorkerConfig::default(),
        ));
        tokio::spawn(worker.run(grants_rx, shutdown.clone()));

        let scheduler = Scheduler::new(
            storage.clone(),
            engine.clone(),
            grants_tx,
            SchedulerConfig::default(),
        );
        Harness {
            storage,
            engine,
            scheduler,
            shutdown,
        }
    }

    #[test]
    fn test_queue_orders_by_admission_then_id() {
        let mut a = crate::storage::tests::sample_job("m", 1).0;
        let mut b = crate::storage::tests::sample_job("m", 1).0;
        let c = crate::storage::tests::sample_job("m", 1).0;
        b.created_at = c.created_at - chrono::Duration::seconds(1);
        a.created_at = b.created_at;
        let mut queue = JobQueue::from_jobs(vec![c.clone(), a.clone(), b.clone()]);

        let (first, second) = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };
        assert_eq!(queue.pop().unwrap().id, first);
        assert_eq!(queue.pop().unwrap().id, second);
        assert_eq!(queue.pop().unwrap().id, c.id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_idle_without_queued_jobs() {
        let h = harness();
        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::Idle);
        assert!(h.engine.calls().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_swaps_models_in_fifo_order() {
        let h = harness();
        let a1 = queued_job(h.storage.as_ref(), "model-a", 2).await;
        let b1 = queued_job(h.storage.as_ref(), "model-b", 1).await;
        let a2 = queued_job(h.storage.as_ref(), "model-a", 1).await;

        for expected in [a1.id, b1.id, a2.id] {
            match h.scheduler.tick().await.unwrap() {
                TickOutcome::Executed { job_id, outcome } => {
                    assert_eq!(job_id, expected);
                    assert_eq!(outcome, ExecutionOutcome::Finalizing);
                }
                other => panic!("unexpected tick outcome: {other:?}"),
            }
        }

        let swaps: Vec<_> = h
            .engine
            .calls()
            .into_iter()
            .filter(|call| !matches!(call, EngineCall::Submit { .. }))
            .collect();
        assert_eq!(
            swaps,
            vec![
                EngineCall::Load("model-a".to_string()),
                EngineCall::Unload("model-a".to_string()),
                EngineCall::Load("model-b".to_string()),
                EngineCall::Unload("model-b".to_string()),
                EngineCall::Load("model-a".to_string()),
            ]
        );
        // Every submission ran against its own job's model
        let submit_models: Vec<_> = h
            .engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Submit { model, .. } => Some(model),
                _ => None,
            })
            .collect();
        let expected: Vec<_> = [&a1, &a1, &b1, &a2]
            .iter()
            .map(|job| Some(job.model.clone()))
            .collect();
        assert_eq!(submit_models, expected);
        assert_eq!(h.scheduler.resident_model().as_deref(), Some("model-a"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_same_model_skips_swap() {
        let h = harness();
        queued_job(h.storage.as_ref(), "model-a", 1).await;
        queued_job(h.storage.as_ref(), "model-a", 1).await;

        h.scheduler.tick().await.unwrap();
        h.scheduler.tick().await.unwrap();

        let loads = h
            .engine
            .calls()
            .into_iter()
            .filter(|call| matches!(call, EngineCall::Load(_) | EngineCall::Unload(_)))
            .count();
        assert_eq!(loads, 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_load_failure_fails_job_and_advances() {
        let h = harness();
        h.engine.fail_load("broken", "CUDA out of memory");
        let bad = queued_job(h.storage.as_ref(), "broken", 2).await;
        let good = queued_job(h.storage.as_ref(), "model-a", 1).await;

        assert_eq!(
            h.scheduler.tick().await.unwrap(),
            TickOutcome::LoadFailed(bad.id)
        );
        let bad = h.storage.get_job(bad.id).await.unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.errors[0].code, "model_load_error");
        assert!(bad.errors[0].message.contains("CUDA out of memory"));
        assert_eq!(h.scheduler.resident_model(), None);
        assert_eq!(h.engine.submit_count(), 0);

        match h.scheduler.tick().await.unwrap() {
            TickOutcome::Executed { job_id, .. } => assert_eq!(job_id, good.id),
            other => panic!("unexpected tick outcome: {other:?}"),
        }
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_expired_head_is_never_granted() {
        let h = harness();
        let (mut job, requests) = crate::storage::tests::sample_job("model-a", 1);
        job.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let id = h.storage.create_job(job, requests).await.unwrap();
        h.storage.transition(id, JobStatus::Queued).await.unwrap();

        assert_eq!(h.scheduler.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(
            h.storage.get_job(id).await.unwrap().status,
            JobStatus::Expired
        );
        assert!(h.engine.calls().is_empty());
        h.shutdown.cancel();
    }
}
