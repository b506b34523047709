//! Batch job orchestrator for a single local inference engine.
//!
//! Clients submit collections of inference requests as jobs. The engine holds one model at a
//! time, so jobs are run one after another in admission order, swapping the resident model
//! whenever the next job needs a different one. This crate provides:
//! - Durable job and per-request state with a strict status state machine
//! - A hot-swap scheduler that loads and unloads models on demand
//! - A worker that streams a job's requests with bounded concurrency and retries
//! - Result handlers run on every finished job
//! - Webhook notifications with retry, backoff and optional signing
//! - Expiry of jobs that overrun their completion window
//!
//! # Example
//! ```ignore
//! use carousel::{Config, FsBlobStore, HttpInferenceEngine, InMemoryStorage, JobInput, Orchestrator};
//!
//! let config = Config::default();
//! let orchestrator = Orchestrator::new(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(HttpInferenceEngine::new(config.engine.clone())),
//!     Arc::new(FsBlobStore::new(&config.blob_root)),
//!     config,
//! );
//!
//! // Start the background loops
//! let services = orchestrator.run(CancellationToken::new()).await?;
//!
//! // Submit a job
//! let job = orchestrator.create_job(JobInput::new("requests.jsonl", "llama-3-8b")).await?;
//!
//! // Check status
//! let job = orchestrator.get_job(job.id).await?;
//! ```

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod handlers;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod sweeper;
pub mod telemetry;
pub mod webhooks;
pub mod worker;

// Re-export commonly used types
pub use blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
pub use config::Config;
pub use engine::{HttpInferenceEngine, InferenceEngine, MockEngine};
pub use error::{CarouselError, Result};
pub use handlers::{HandlerRegistry, ResultHandler};
pub use job::*;
pub use orchestrator::{BackgroundServices, Orchestrator};
pub use retry::RetryConfig;
pub use storage::in_memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStorage;
pub use storage::Storage;
