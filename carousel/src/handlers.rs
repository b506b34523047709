//! Result handlers run once a job reaches `finalizing`.
//!
//! Handlers are registered in order and each runs inside a fault boundary: an error, a `false`
//! return, or a panic is logged and recorded in the [`HandlerReport`], and the remaining handlers
//! still run. Nothing a handler does can stop the job from completing.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{BatchRequest, JobId, Metadata, RequestOutcome};

/// Post-processing step over a finished job's results.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Disabled handlers are skipped.
    fn enabled(&self) -> bool {
        true
    }

    /// Process the full result set. `Ok(false)` reports a failure without an error value.
    async fn handle(
        &self,
        job_id: JobId,
        results: &[BatchRequest],
        metadata: &Metadata,
    ) -> Result<bool>;
}

/// What happened to one handler during a finalization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Succeeded,
    Skipped,
    Failed(String),
}

/// Per-handler outcomes of one finalization pass, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerReport {
    pub outcomes: Vec<(String, HandlerOutcome)>,
}

impl HandlerReport {
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            HandlerOutcome::Failed(_) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn outcome(&self, name: &str) -> Option<&HandlerOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered collection of result handlers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn ResultHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn ResultHandler>) {
        tracing::info!(handler = handler.name(), "Registered result handler");
        self.handlers.write().push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Run every enabled handler in registration order.
    #[tracing::instrument(skip(self, results, metadata), fields(job_id = %job_id, results = results.len()))]
    pub async fn run(
        &self,
        job_id: JobId,
        results: &[BatchRequest],
        metadata: &Metadata,
    ) -> HandlerReport {
        let handlers: Vec<Arc<dyn ResultHandler>> = self.handlers.read().clone();
        let mut report = HandlerReport::default();

        for handler in handlers {
            let name = handler.name().to_string();
            if !handler.enabled() {
                tracing::debug!(handler = %name, "Result handler disabled, skipping");
                report.outcomes.push((name, HandlerOutcome::Skipped));
                continue;
            }

            let outcome = match AssertUnwindSafe(handler.handle(job_id, results, metadata))
                .catch_unwind()
                .await
            {
                Ok(Ok(true)) => HandlerOutcome::Succeeded,
                Ok(Ok(false)) => HandlerOutcome::Failed("handler reported failure".to_string()),
                Ok(Err(e)) => HandlerOutcome::Failed(e.to_string()),
                Err(payload) => {
                    HandlerOutcome::Failed(format!("panicked: {}", panic_message(payload)))
                }
            };

            match &outcome {
                HandlerOutcome::Failed(reason) => {
                    metrics::counter!("carousel_result_handler_failures_total", "handler" => name.clone())
                        .increment(1);
                    tracing::error!(handler = %name, job_id = %job_id, reason = %reason, "Result handler failed");
                }
                _ => tracing::debug!(handler = %name, job_id = %job_id, "Result handler finished"),
            }
            report.outcomes.push((name, outcome));
        }

        report
    }
}

/// Token usage aggregated over a job's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub responses: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageSummary {
    /// Sum the `usage` blocks of OpenAI-style response bodies.
    pub fn from_results(results: &[BatchRequest]) -> Self {
        let mut summary = UsageSummary::default();
        for request in results {
            let Some(RequestOutcome::Response { body, .. }) = &request.outcome else {
                continue;
            };
            summary.responses += 1;
            let Some(usage) = body.get("usage") else {
                continue;
            };
            let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
            summary.prompt_tokens += field("prompt_tokens");
            summary.completion_tokens += field("completion_tokens");
            summary.total_tokens += field("total_tokens");
        }
        summary
    }
}

/// Built-in handler that logs token usage for each finished job.
pub struct UsageSummaryHandler {
    enabled: bool,
}

impl UsageSummaryHandler {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl ResultHandler for UsageSummaryHandler {
    fn name(&self) -> &str {
        "usage_summary"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn handle(
        &self,
        job_id: JobId,
        results: &[BatchRequest],
        _metadata: &Metadata,
    ) -> Result<bool> {
        let summary = UsageSummary::from_results(results);
        metrics::counter!("carousel_tokens_total", "kind" => "prompt")
            .increment(summary.prompt_tokens);
        metrics::counter!("carousel_tokens_total", "kind" => "completion")
            .increment(summary.completion_tokens);
        tracing::info!(
            job_id = %job_id,
            responses = summary.responses,
            prompt_tokens = summary.prompt_tokens,
            completion_tokens = summary.completion_tokens,
            total_tokens = summary.total_tokens,
            "Batch usage summary"
        );
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CarouselError;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Handler that records the jobs it saw and behaves as configured.
    pub(crate) struct RecordingHandler {
        pub name: String,
        pub enabled: bool,
        pub behaviour: Behaviour,
        pub seen: Arc<Mutex<Vec<(JobId, usize)>>>,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum Behaviour {
        Succeed,
        ReturnFalse,
        Error,
        Panic,
    }

    impl RecordingHandler {
        pub(crate) fn new(name: &str, behaviour: Behaviour) -> Self {
            Self {
                name: name.to_string(),
                enabled: true,
                behaviour,
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ResultHandler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn handle(
            &self,
            job_id: JobId,
            results: &[BatchRequest],
            _metadata: &Metadata,
        ) -> Result<bool> {
            self.seen.lock().push((job_id, results.len()));
            match self.behaviour {
                Behaviour::Succeed => Ok(true),
                Behaviour::ReturnFalse => Ok(false),
                Behaviour::Error => Err(CarouselError::Handler {
                    handler: self.name.clone(),
                    message: "sink unavailable".to_string(),
                }),
                Behaviour::Panic => panic!("handler exploded"),
            }
        }
    }

    fn response(tokens: u64) -> BatchRequest {
        BatchRequest {
            custom_id: format!("r{}", tokens),
            line: 1,
            method: "POST".to_string(),
            url: "/v1/chat/completions".to_string(),
            body: json!({}),
            outcome: Some(RequestOutcome::Response {
                status_code: 200,
                body: json!({"usage": {"prompt_tokens": tokens, "completion_tokens": 1, "total_tokens": tokens + 1}}),
            }),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_handlers() {
        let registry = HandlerRegistry::new();
        let mut disabled = RecordingHandler::new("disabled", Behaviour::Succeed);
        disabled.enabled = false;
        let disabled_seen = disabled.seen.clone();
        let last = RecordingHandler::new("last", Behaviour::Succeed);
        let last_seen = last.seen.clone();

        registry.register(Arc::new(disabled));
        registry.register(Arc::new(RecordingHandler::new("panics", Behaviour::Panic)));
        registry.register(Arc::new(RecordingHandler::new("errors", Behaviour::Error)));
        registry.register(Arc::new(RecordingHandler::new("declines", Behaviour::ReturnFalse)));
        registry.register(Arc::new(last));

        let job_id = JobId::new();
        let report = registry
            .run(job_id, &[response(2)], &Metadata::new())
            .await;

        assert_eq!(report.outcome("disabled"), Some(&HandlerOutcome::Skipped));
        assert!(disabled_seen.lock().is_empty());
        assert_eq!(
            report.failed().collect::<Vec<_>>(),
            vec!["panics", "errors", "declines"]
        );
        assert!(matches!(
            report.outcome("panics"),
            Some(HandlerOutcome::Failed(reason)) if reason.contains("handler exploded")
        ));
        assert_eq!(report.outcome("last"), Some(&HandlerOutcome::Succeeded));
        assert_eq!(*last_seen.lock(), vec![(job_id, 1)]);
    }

    #[test]
    fn test_usage_summary_sums_responses() {
        let mut failed = response(100);
        failed.outcome = Some(RequestOutcome::Error {
            message: "boom".to_string(),
        });
        let summary = UsageSummary::from_results(&[response(2), response(3), failed]);
        assert_eq!(
            summary,
            UsageSummary {
                responses: 2,
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
            }
        );
    }
}
