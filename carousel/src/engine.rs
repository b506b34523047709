//! Inference engine abstraction.
//!
//! The engine serves one model at a time. The scheduler drives [`InferenceEngine::load_model`]
//! and [`InferenceEngine::unload_model`]; the worker only calls [`InferenceEngine::submit`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;

/// A single request forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRequest {
    pub custom_id: String,
    pub method: String,
    /// Path on the engine, such as `/v1/chat/completions`
    pub url: String,
    pub body: serde_json::Value,
}

/// A successful engine response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Engine failures, split so the worker can decide whether to retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The request never got a usable answer (connection failure, timeout, overload).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine answered and rejected the request.
    #[error("Model error: {message}")]
    Model {
        status: Option<u16>,
        message: String,
    },
}

impl EngineError {
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

/// Status codes that indicate a transient fault rather than a rejected request:
/// server errors (5xx), rate limits (429), and timeouts (408).
pub fn is_transport_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// A local model-serving engine that holds one model at a time.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// Run one request against the resident model.
    async fn submit(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError>;

    /// Load `model` into GPU memory.
    async fn load_model(&self, model: &str) -> Result<(), EngineError>;

    /// Release the resident model.
    async fn unload_model(&self) -> Result<(), EngineError>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Connection settings for [`HttpInferenceEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Base URL of the OpenAI-compatible server
    pub base_url: String,
    /// Sent as a bearer token when set
    pub api_key: Option<String>,
    /// Timeout for each individual request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Endpoint that loads a model; receives `{"model": "<id>"}`
    pub load_path: String,
    /// Endpoint that unloads the resident model
    pub unload_path: String,
    /// Model loads can take minutes
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(600),
            load_path: "/v1/models/load".to_string(),
            unload_path: "/v1/models/unload".to_string(),
            load_timeout: Duration::from_secs(900),
        }
    }
}

/// Engine adapter for an OpenAI-compatible HTTP server.
#[derive(Clone)]
pub struct HttpInferenceEngine {
    client: reqwest::Client,
    config: EngineConfig,
}

impl HttpInferenceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    /// POST a control request (load/unload) and map failures onto [`EngineError`].
    async fn control(&self, path: &str, body: serde_json::Value) -> Result<(), EngineError> {
        let response = self
            .authorize(self.client.post(self.endpoint(path)))
            .timeout(self.config.load_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        if is_transport_status(status.as_u16()) {
            Err(EngineError::Transport(format!("HTTP {}: {}", status.as_u16(), message)))
        } else {
            Err(EngineError::Model {
                status: Some(status.as_u16()),
                message,
            })
        }
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    #[tracing::instrument(skip(self, request), fields(custom_id = %request.custom_id, method = %request.method, url = %request.url))]
    async fn submit(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        let method: reqwest::Method = request.method.parse().map_err(|e| EngineError::Model {
            status: None,
            message: format!("Invalid HTTP method '{}': {}", request.method, e),
        })?;

        let mut req = self
            .authorize(self.client.request(method.clone(), self.endpoint(&request.url)))
            .timeout(self.config.request_timeout);
        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            req = req.json(&request.body);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, "Engine request failed");
            EngineError::Transport(e.to_string())
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        tracing::debug!(status, response_len = text.len(), "Engine request completed");

        if is_transport_status(status) {
            return Err(EngineError::Transport(format!("HTTP {}: {}", status, text)));
        }
        if !(200..300).contains(&status) {
            return Err(EngineError::Model {
                status: Some(status),
                message: text,
            });
        }

        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(EngineResponse { status, body })
    }

    #[tracing::instrument(skip(self))]
    async fn load_model(&self, model: &str) -> Result<(), EngineError> {
        self.control(&self.config.load_path, json!({ "model": model }))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn unload_model(&self) -> Result<(), EngineError> {
        self.control(&self.config.unload_path, json!({})).await
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Something the mock engine was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Load(String),
    Unload(String),
    /// A submission and the model that was resident when it arrived
    Submit {
        custom_id: String,
        model: Option<String>,
    },
}

/// Scripted engine for tests.
///
/// Responses are queued per custom_id and returned in FIFO order; requests without a scripted
/// response get a 200 with a chat-completion shaped body.
#[derive(Clone, Default)]
pub struct MockEngine {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<EngineResponse, EngineError>>>>>,
    load_failures: Arc<Mutex<HashMap<String, String>>>,
    resident: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<EngineCall>>>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a custom_id.
    pub fn add_response(&self, custom_id: &str, response: Result<EngineResponse, EngineError>) {
        self.responses
            .lock()
            .entry(custom_id.to_string())
            .or_default()
            .push_back(response);
    }

    /// Make every load of `model` fail.
    pub fn fail_load(&self, model: &str, message: &str) {
        self.load_failures
            .lock()
            .insert(model.to_string(), message.to_string());
    }

    /// Block submissions until [`MockEngine::open`] is called.
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Stop holding submissions.
    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn resident_model(&self) -> Option<String> {
        self.resident.lock().clone()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// custom_ids submitted so far, in arrival order.
    pub fn submitted(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::Submit { custom_id, .. } => Some(custom_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn submit_count(&self) -> usize {
        self.submitted().len()
    }

    /// Highest number of concurrent submissions observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for MockEngine {
    async fn submit(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        let model = self.resident.lock().clone();
        self.calls.lock().push(EngineCall::Submit {
            custom_id: request.custom_id.clone(),
            model: model.clone(),
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = scopeguard::guard(self.in_flight.clone(), |counter| {
            counter.fetch_sub(1, Ordering::SeqCst);
        });

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let scripted = self
            .responses
            .lock()
            .get_mut(&request.custom_id)
            .and_then(|queue| queue.pop_front());

        scripted.unwrap_or_else(|| {
            Ok(EngineResponse {
                status: 200,
                body: json!({
                    "id": format!("chatcmpl-{}", request.custom_id),
                    "object": "chat.completion",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "ok"},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
                }),
            })
        })
    }

    async fn load_model(&self, model: &str) -> Result<(), EngineError> {
        self.calls.lock().push(EngineCall::Load(model.to_string()));
        if let Some(message) = self.load_failures.lock().get(model) {
            return Err(EngineError::Model {
                status: None,
                message: message.clone(),
            });
        }
        *self.resident.lock() = Some(model.to_string());
        Ok(())
    }

    async fn unload_model(&self) -> Result<(), EngineError> {
        let previous = self.resident.lock().take();
        self.calls
            .lock()
            .push(EngineCall::Unload(previous.unwrap_or_default()));
        Ok(())
    }
}
