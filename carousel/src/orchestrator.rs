//! Orchestrator: the public face of the crate.
//!
//! Owns the component wiring. Jobs are admitted through [`Orchestrator::create_job`] and observed
//! through [`Orchestrator::get_job`]; [`Orchestrator::run`] starts the background loops:
//!
//! - **scheduler**: picks the next queued job, swaps the engine's model, grants the job
//! - **worker**: executes the granted job's requests
//! - **finalizer**: writes results, runs result handlers, completes the job
//! - **expiry sweeper**: expires overdue jobs
//! - **webhook dispatcher**: delivers status notifications (when enabled)

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::engine::InferenceEngine;
use crate::error::{CarouselError, Result};
use crate::finalizer::Finalizer;
use crate::handlers::{HandlerRegistry, ResultHandler, UsageSummaryHandler};
use crate::job::{BatchRequest, Job, JobError, JobFilter, JobId, JobInput, JobStatus};
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::sweeper::ExpirySweeper;
use crate::webhooks::WebhookDispatcher;
use crate::worker::{SlotGrant, Worker};

pub struct Orchestrator<S, E, B>
where
    S: Storage,
    E: InferenceEngine,
    B: BlobStore,
{
    storage: Arc<S>,
    blobs: Arc<B>,
    handlers: HandlerRegistry,
    scheduler: Arc<Scheduler<S, E>>,
    worker: Arc<Worker<S, E>>,
    grants: Mutex<Option<mpsc::Receiver<SlotGrant>>>,
    config: Config,
}

/// Handles to the background loops started by [`Orchestrator::run`].
///
/// Dropping this cancels the shutdown token, which stops every loop.
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks.drain(..) {
            let _ = handle.await;
        }
    }
}

impl<S, E, B> Orchestrator<S, E, B>
where
    S: Storage + 'static,
    E: InferenceEngine,
    B: BlobStore,
{
    pub fn new(storage: Arc<S>, engine: Arc<E>, blobs: Arc<B>, config: Config) -> Self {
        // The scheduler waits for each grant's release, so one slot is enough
        let (grant_tx, grant_rx) = mpsc::channel(1);
        let scheduler = Arc::new(Scheduler::new(
            storage.clone(),
            engine.clone(),
            grant_tx,
            config.scheduler,
        ));
        let worker = Arc::new(Worker::new(storage.clone(), engine, config.worker));

        let handlers = HandlerRegistry::new();
        handlers.register(Arc::new(UsageSummaryHandler::new(
            config.handlers.usage_summary,
        )));

        Self {
            storage,
            blobs,
            handlers,
            scheduler,
            worker,
            grants: Mutex::new(Some(grant_rx)),
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Validate and persist a new job. Returns once the job is `queued`.
    ///
    /// A job that fails validation is still recorded, as `failed` with its errors, and the
    /// validation error is returned.
    #[tracing::instrument(skip(self, input), fields(input_ref = %input.input_ref, model = %input.model))]
    pub async fn create_job(&self, input: JobInput) -> Result<Job> {
        let completion_window = input
            .completion_window
            .clone()
            .unwrap_or_else(|| self.config.default_completion_window.clone());

        let requests = match self.validate(&input, &completion_window).await {
            Ok(requests) => requests,
            Err(e) if e.is_validation() => {
                self.record_rejected(input, completion_window, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let job = Job::new(&input, completion_window, requests.len() as i64);
        let job_id = self.storage.create_job(job, requests).await?;
        let job = self.storage.transition(job_id, JobStatus::Queued).await?;

        metrics::counter!("carousel_jobs_created_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            total = job.request_counts.total,
            expires_at = ?job.expires_at,
            "Job queued"
        );
        Ok(job)
    }

    async fn validate(&self, input: &JobInput, completion_window: &str) -> Result<Vec<BatchRequest>> {
        if input.model.trim().is_empty() {
            return Err(CarouselError::InvalidParameters("model must not be empty".to_string()));
        }
        match humantime::parse_duration(completion_window) {
            Ok(window) if !window.is_zero() => {}
            Ok(_) => {
                return Err(CarouselError::InvalidParameters(
                    "completion_window must be positive".to_string(),
                ))
            }
            Err(e) => {
                return Err(CarouselError::InvalidParameters(format!(
                    "completion_window '{}' is not a duration: {}",
                    completion_window, e
                )))
            }
        }
        if let Some(webhook_url) = &input.webhook_url {
            validate_webhook_url(webhook_url)?;
        }

        self.blobs.read_requests(&input.input_ref, &input.model).await
    }

    /// Persist a rejected job as `failed` so it can be inspected later.
    async fn record_rejected(&self, mut input: JobInput, completion_window: String, error: &CarouselError) -> Result<()> {
        // Never notify an address that did not validate
        if input
            .webhook_url
            .as_deref()
            .is_some_and(|url| validate_webhook_url(url).is_err())
        {
            input.webhook_url = None;
        }

        let job = Job::new(&input, completion_window, 0);
        let job_id = self.storage.create_job(job, Vec::new()).await?;
        self.storage
            .append_errors(job_id, vec![JobError::from(error)])
            .await?;
        self.storage.transition(job_id, JobStatus::Failed).await?;

        metrics::counter!("carousel_jobs_rejected_total", "code" => error.code()).increment(1);
        tracing::warn!(job_id = %job_id, error = %error, "Job rejected at validation");
        Ok(())
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.storage.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.storage.list_jobs(filter).await
    }

    /// Cancel a job.
    ///
    /// A queued job is cancelled immediately. An in-progress job is asked to stop: the worker
    /// issues no further requests, lets in-flight ones finish, then moves it to `cancelled`.
    /// Jobs that are finalizing or already terminal fail with `AlreadyTerminal`.
    #[tracing::instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        let job = self.storage.cancel(job_id).await?;
        tracing::info!(status = %job.status, "Cancel requested");
        Ok(job)
    }

    /// Add a handler to run on every job that reaches `finalizing`. Handlers run in
    /// registration order.
    pub fn register_result_handler(&self, handler: Arc<dyn ResultHandler>) {
        tracing::info!(handler = handler.name(), "Registering result handler");
        self.handlers.register(handler);
    }

    /// The model currently loaded on the engine, if any.
    pub fn resident_model(&self) -> Option<String> {
        self.scheduler.resident_model()
    }

    pub fn requests_in_flight(&self) -> usize {
        self.worker.requests_in_flight()
    }

    /// Recover jobs interrupted by a previous shutdown, then start every background loop.
    ///
    /// Can only be called once per orchestrator.
    pub async fn run(&self, shutdown_token: CancellationToken) -> Result<BackgroundServices> {
        let grants = self.grants.lock().take().ok_or_else(|| {
            CarouselError::Other(anyhow::anyhow!("Orchestrator is already running"))
        })?;

        let recovered = self.storage.recover_interrupted().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered jobs interrupted by shutdown");
        }

        let drop_guard = shutdown_token.clone().drop_guard();
        let mut background_tasks = Vec::new();

        let worker = self.worker.clone();
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(grants, token).await {
                tracing::error!(error = %e, "Worker stopped with error");
            }
        }));

        let scheduler = self.scheduler.clone();
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(token).await {
                tracing::error!(error = %e, "Scheduler stopped with error");
            }
        }));

        let finalizer = Finalizer::new(
            self.storage.clone(),
            self.blobs.clone(),
            self.handlers.clone(),
            self.config.finalizer,
        );
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = finalizer.run(token).await {
                tracing::error!(error = %e, "Finalizer stopped with error");
            }
        }));

        let sweeper = ExpirySweeper::new(self.storage.clone(), self.config.expiry);
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = sweeper.run(token).await {
                tracing::error!(error = %e, "Expiry sweeper stopped with error");
            }
        }));

        if self.config.webhooks.enabled {
            let dispatcher = WebhookDispatcher::spawn(
                self.storage.clone(),
                self.config.webhooks.clone(),
                shutdown_token.clone(),
            )?;
            let token = shutdown_token.clone();
            background_tasks.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.run(token).await {
                    tracing::error!(error = %e, "Webhook dispatcher stopped with error");
                }
            }));
        } else {
            tracing::info!("Webhook delivery disabled");
        }

        tracing::info!(handlers = self.handlers.len(), "Orchestrator running");
        Ok(BackgroundServices {
            background_tasks,
            shutdown_token,
            drop_guard: Some(drop_guard),
        })
    }
}

fn validate_webhook_url(webhook_url: &str) -> Result<()> {
    let url = Url::parse(webhook_url).map_err(|e| {
        CarouselError::InvalidParameters(format!("webhook_url '{}' is not a URL: {}", webhook_url, e))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(CarouselError::InvalidParameters(format!(
            "webhook_url must use http or https, not {}",
            scheme
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{output_ref_for, InMemoryBlobStore};
    use crate::engine::{EngineCall, EngineError, MockEngine};
    use crate::handlers::tests::{Behaviour, RecordingHandler};
    use crate::job::WebhookStatus;
    use crate::retry::RetryConfig;
    use crate::storage::InMemoryStorage;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type TestOrchestrator = Orchestrator<InMemoryStorage, MockEngine, InMemoryBlobStore>;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.scheduler.poll_interval = Duration::from_millis(10);
        config.finalizer.poll_interval = Duration::from_millis(10);
        config.expiry.sweep_interval = Duration::from_millis(10);
        config.webhooks.poll_interval = Duration::from_millis(10);
        config.webhooks.timeout = Duration::from_secs(5);
        config.webhooks.retry = RetryConfig {
            max_attempts: 5,
            backoff_ms: 1,
            backoff_factor: 1,
            max_backoff_ms: 1,
        };
        config.worker.retry = RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_factor: 1,
            max_backoff_ms: 1,
        };
        config
    }

    fn setup() -> (TestOrchestrator, MockEngine, Arc<InMemoryBlobStore>) {
        let engine = MockEngine::new();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(engine.clone()),
            blobs.clone(),
            fast_config(),
        );
        (orchestrator, engine, blobs)
    }

    fn input_file(model: &str, ids: &[&str]) -> String {
        ids.iter()
            .map(|id| {
                json!({
                    "custom_id": id,
                    "method": "POST",
                    "url": "/v1/chat/completions",
                    "body": {"model": model, "messages": [{"role": "user", "content": id}]}
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn wait_for_status(orchestrator: &TestOrchestrator, job_id: JobId, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = orchestrator.get_job(job_id).await.unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job stuck in {} waiting for {}",
                job.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_partial_failure_completes_job() {
        let (orchestrator, engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["a", "b", "c"]));
        engine.add_response(
            "b",
            Err(EngineError::Model {
                status: Some(400),
                message: "context length exceeded".to_string(),
            }),
        );

        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.request_counts.total, 3);

        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        let job = wait_for_status(&orchestrator, job.id, JobStatus::Completed).await;
        services.shutdown().await;

        assert_eq!(job.request_counts.completed, 2);
        assert_eq!(job.request_counts.failed, 1);
        assert_eq!(job.output_ref, Some(output_ref_for(job.id)));

        let output = String::from_utf8(blobs.get(&output_ref_for(job.id)).await.unwrap()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        let failed = lines.iter().find(|line| line["custom_id"] == "b").unwrap();
        assert!(failed["response"].is_null());
        assert!(failed["error"]["message"]
            .as_str()
            .unwrap()
            .contains("context length exceeded"));
    }

    #[test_log::test(tokio::test)]
    async fn test_models_swap_in_admission_order() {
        let (orchestrator, engine, blobs) = setup();
        blobs.insert("a1.jsonl", input_file("model-a", &["a1"]));
        blobs.insert("b1.jsonl", input_file("model-b", &["b1"]));
        blobs.insert("a2.jsonl", input_file("model-a", &["a2"]));

        let mut ids = Vec::new();
        for (input, model) in [("a1.jsonl", "model-a"), ("b1.jsonl", "model-b"), ("a2.jsonl", "model-a")] {
            ids.push(orchestrator.create_job(JobInput::new(input, model)).await.unwrap().id);
            // Distinct admission timestamps
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        for id in &ids {
            wait_for_status(&orchestrator, *id, JobStatus::Completed).await;
        }
        services.shutdown().await;

        let loads: Vec<_> = engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Load(model) => Some(model),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec!["model-a", "model-b", "model-a"]);
        assert_eq!(engine.submitted(), vec!["a1", "b1", "a2"]);

        // No submission ever reached a model other than its job's
        for call in engine.calls() {
            if let EngineCall::Submit { custom_id, model } = call {
                let expected = if custom_id.starts_with('a') { "model-a" } else { "model-b" };
                assert_eq!(model.as_deref(), Some(expected));
            }
        }
        assert_eq!(orchestrator.resident_model().as_deref(), Some("model-a"));
    }

    #[tokio::test]
    async fn test_webhook_retries_do_not_block_completion() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let (orchestrator, _engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x"]));
        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama").with_webhook(mock_server.uri()))
            .await
            .unwrap();

        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Completed).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let job = loop {
            let job = orchestrator.get_job(job.id).await.unwrap();
            if job.webhook.status == WebhookStatus::Delivered {
                break job;
            }
            assert!(tokio::time::Instant::now() < deadline, "webhook never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        services.shutdown().await;

        assert_eq!(job.webhook.delivered_sequence, job.webhook.sequence);
        assert!(job.webhook.attempts >= 3);

        let received = mock_server.received_requests().await.unwrap();
        let newest = received
            .iter()
            .map(|request| request.body_json::<Value>().unwrap())
            .max_by_key(|body| body["sequence"].as_i64().unwrap())
            .unwrap();
        assert_eq!(newest["type"], "batch.completed");
        assert_eq!(newest["request_counts"]["completed"], 1);
    }

    #[tokio::test]
    async fn test_job_expires_while_queued() {
        let (orchestrator, engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x", "y"]));
        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama").with_completion_window("1ms"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        let job = wait_for_status(&orchestrator, job.id, JobStatus::Expired).await;
        services.shutdown().await;

        assert!(job.expired_at.is_some());
        assert_eq!(engine.submit_count(), 0);
        assert_eq!(job.request_counts.resolved(), 0);
    }

    #[tokio::test]
    async fn test_validation_failures_are_recorded() {
        let (orchestrator, _engine, blobs) = setup();
        blobs.insert("empty.jsonl", "\n\n");
        blobs.insert(
            "broken.jsonl",
            format!("{}\n{{\"custom_id\": \"b\"", input_file("llama", &["a"])),
        );
        blobs.insert("ok.jsonl", input_file("llama", &["a"]));

        let err = orchestrator
            .create_job(JobInput::new("empty.jsonl", "llama"))
            .await
            .unwrap_err();
        assert!(matches!(err, CarouselError::EmptyInput { .. }));

        let err = orchestrator
            .create_job(JobInput::new("broken.jsonl", "llama"))
            .await
            .unwrap_err();
        assert!(matches!(err, CarouselError::MalformedRequest { line: 2, .. }));

        let err = orchestrator
            .create_job(JobInput::new("ok.jsonl", "llama").with_webhook("ftp://example.com/hook"))
            .await
            .unwrap_err();
        assert!(matches!(err, CarouselError::InvalidParameters(_)));

        let err = orchestrator
            .create_job(JobInput::new("ok.jsonl", "llama").with_completion_window("eventually"))
            .await
            .unwrap_err();
        assert!(matches!(err, CarouselError::InvalidParameters(_)));

        let failed = orchestrator
            .list_jobs(&JobFilter::with_statuses([JobStatus::Failed]))
            .await
            .unwrap();
        assert_eq!(failed.len(), 4);
        assert!(failed.iter().all(|job| job.errors.len() == 1));
        assert!(failed.iter().all(|job| job.webhook.url.is_none()));
        let malformed = failed
            .iter()
            .find(|job| job.input_ref == "broken.jsonl")
            .unwrap();
        assert_eq!(malformed.errors[0].code, "malformed_request");
        assert_eq!(malformed.errors[0].line, Some(2));

        // A missing input is an I/O problem, not a job: nothing is recorded
        assert!(orchestrator
            .create_job(JobInput::new("missing.jsonl", "llama"))
            .await
            .is_err());
        assert_eq!(orchestrator.list_jobs(&JobFilter::default()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_terminal_jobs() {
        let (orchestrator, _engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x"]));
        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();

        let cancelled = orchestrator.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        let err = orchestrator.cancel_job(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            CarouselError::AlreadyTerminal {
                status: JobStatus::Cancelled,
                ..
            }
        ));
        assert!(matches!(
            orchestrator.cancel_job(JobId::new()).await.unwrap_err(),
            CarouselError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_finalizing_job_is_rejected() {
        let (orchestrator, _engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x"]));
        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();

        let storage = orchestrator.storage();
        storage.transition(job.id, JobStatus::InProgress).await.unwrap();
        storage
            .record_result(
                job.id,
                "x",
                crate::job::RequestOutcome::Response {
                    status_code: 200,
                    body: json!({}),
                },
            )
            .await
            .unwrap();
        storage.transition(job.id, JobStatus::Finalizing).await.unwrap();

        let err = orchestrator.cancel_job(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            CarouselError::AlreadyTerminal {
                status: JobStatus::Finalizing,
                ..
            }
        ));
        let job = orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Finalizing);
        assert!(job.cancelling_at.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_job_admitted_mid_execution_waits_for_slot() {
        let (orchestrator, engine, blobs) = setup();
        blobs.insert("b.jsonl", input_file("model-b", &["b1", "b2"]));
        blobs.insert("a.jsonl", input_file("model-a", &["a1"]));
        engine.hold();

        let b = orchestrator
            .create_job(JobInput::new("b.jsonl", "model-b"))
            .await
            .unwrap();
        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        wait_for_status(&orchestrator, b.id, JobStatus::InProgress).await;

        let a = orchestrator
            .create_job(JobInput::new("a.jsonl", "model-a"))
            .await
            .unwrap();
        // Several scheduler ticks while B holds the slot
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(orchestrator.get_job(a.id).await.unwrap().status, JobStatus::Queued);
        let running = orchestrator
            .list_jobs(&JobFilter::with_statuses([JobStatus::InProgress]))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
        assert_eq!(orchestrator.resident_model().as_deref(), Some("model-b"));

        engine.open();
        wait_for_status(&orchestrator, b.id, JobStatus::Completed).await;
        wait_for_status(&orchestrator, a.id, JobStatus::Completed).await;
        services.shutdown().await;

        let swaps: Vec<_> = engine
            .calls()
            .into_iter()
            .filter(|call| !matches!(call, EngineCall::Submit { .. }))
            .collect();
        assert_eq!(
            swaps,
            vec![
                EngineCall::Load("model-b".to_string()),
                EngineCall::Unload("model-b".to_string()),
                EngineCall::Load("model-a".to_string()),
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_in_progress_stops_submissions() {
        let (orchestrator, engine, blobs) = setup();
        let ids: Vec<String> = (0..40).map(|i| format!("r{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        blobs.insert("in.jsonl", input_file("llama", &id_refs));
        engine.hold();

        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();
        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::InProgress).await;

        let requested = orchestrator.cancel_job(job.id).await.unwrap();
        assert_eq!(requested.status, JobStatus::InProgress);
        assert!(requested.cancelling_at.is_some());
        engine.open();

        let job = wait_for_status(&orchestrator, job.id, JobStatus::Cancelled).await;
        services.shutdown().await;

        assert!(engine.submit_count() < 40);
        assert!(job.request_counts.resolved() < 40);
    }

    #[tokio::test]
    async fn test_result_handlers_run_once_per_job() {
        let (orchestrator, _engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x", "y"]));
        let recorder = RecordingHandler::new("recorder", Behaviour::Succeed);
        let seen = recorder.seen.clone();
        orchestrator.register_result_handler(Arc::new(RecordingHandler::new("broken", Behaviour::Error)));
        orchestrator.register_result_handler(Arc::new(recorder));

        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();
        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Completed).await;
        services.shutdown().await;

        assert_eq!(*seen.lock(), vec![(job.id, 2)]);
    }

    #[tokio::test]
    async fn test_run_recovers_interrupted_jobs() {
        let (orchestrator, engine, blobs) = setup();
        blobs.insert("in.jsonl", input_file("llama", &["x", "y"]));
        let job = orchestrator
            .create_job(JobInput::new("in.jsonl", "llama"))
            .await
            .unwrap();
        // Left behind by a crashed process
        orchestrator
            .storage()
            .transition(job.id, JobStatus::InProgress)
            .await
            .unwrap();

        // Persisted by an admission that never reached `queued`
        blobs.insert("late.jsonl", input_file("llama", &["z"]));
        let requests = blobs.read_requests("late.jsonl", "llama").await.unwrap();
        let admitting = Job::new(&JobInput::new("late.jsonl", "llama"), "24h".to_string(), 1);
        let admitting = orchestrator
            .storage()
            .create_job(admitting, requests)
            .await
            .unwrap();

        let services = orchestrator.run(CancellationToken::new()).await.unwrap();
        let job = wait_for_status(&orchestrator, job.id, JobStatus::Completed).await;
        let admitted = wait_for_status(&orchestrator, admitting, JobStatus::Completed).await;
        services.shutdown().await;

        assert_eq!(job.request_counts.completed, 2);
        assert_eq!(admitted.request_counts.completed, 1);
        assert_eq!(engine.submit_count(), 3);
    }

    #[tokio::test]
    async fn test_run_only_once() {
        let (orchestrator, _engine, _blobs) = setup();
        let token = CancellationToken::new();
        let services = orchestrator.run(token.clone()).await.unwrap();
        assert!(orchestrator.run(token).await.is_err());
        services.shutdown().await;
    }
}
