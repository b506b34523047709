//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `carousel.yaml` but can be set with the `-f` flag or the `CAROUSEL_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `carousel.yaml`)
//! 2. **Environment variables** - Variables prefixed with `CAROUSEL_` override YAML values
//! 3. **DATABASE_URL** - Special case: overrides `database_url` if set
//!
//! Nested values use double underscores, e.g. `CAROUSEL_WORKER__MAX_CONCURRENCY=32` sets
//! `worker.max_concurrency`.
//!
//! ## Example
//!
//! ```yaml
//! database_url: postgres://carousel@localhost/carousel
//! blob_root: /var/lib/carousel/blobs
//! default_completion_window: 24h
//! engine:
//!   base_url: http://localhost:8000
//!   load_timeout: 15m
//! worker:
//!   max_concurrency: 32
//! webhooks:
//!   signing_secret: whsec_c2VjcmV0LWtleS1ieXRlcw==
//!   retry:
//!     max_attempts: 8
//! ```

use std::path::PathBuf;

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::{CarouselError, Result};
use crate::finalizer::FinalizerConfig;
use crate::scheduler::SchedulerConfig;
use crate::sweeper::ExpiryConfig;
use crate::webhooks::WebhookConfig;
use crate::worker::WorkerConfig;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CAROUSEL_CONFIG", default_value = "carousel.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the orchestrator.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// PostgreSQL connection string. Jobs are kept in memory when unset.
    pub database_url: Option<String>,
    /// Directory that input and output references resolve against
    pub blob_root: PathBuf,
    /// Completion window for jobs created without one
    pub default_completion_window: String,
    /// Export traces over OTLP (configured by the standard `OTEL_*` variables)
    pub enable_otel_export: bool,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub finalizer: FinalizerConfig,
    pub webhooks: WebhookConfig,
    pub expiry: ExpiryConfig,
    pub handlers: HandlersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            blob_root: PathBuf::from("./blobs"),
            default_completion_window: "24h".to_string(),
            enable_otel_export: false,
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            finalizer: FinalizerConfig::default(),
            webhooks: WebhookConfig::default(),
            expiry: ExpiryConfig::default(),
            handlers: HandlersConfig::default(),
        }
    }
}

/// Built-in result handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlersConfig {
    /// Log aggregated token usage when a job finishes
    pub usage_summary: bool,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self { usage_summary: true }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> std::result::Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // CAROUSEL_CONFIG names the file itself
            .merge(Env::prefixed("CAROUSEL_").ignore(&["config"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(CarouselError::InvalidParameters(format!("Config validation: {}", message)));

        if self.worker.max_concurrency == 0 {
            return invalid("worker.max_concurrency must be at least 1".to_string());
        }
        if self.worker.retry.max_attempts == 0 {
            return invalid("worker.retry.max_attempts must be at least 1".to_string());
        }
        if self.webhooks.retry.max_attempts == 0 {
            return invalid("webhooks.retry.max_attempts must be at least 1".to_string());
        }
        if self.webhooks.max_concurrent_sends == 0 || self.webhooks.channel_capacity == 0 {
            return invalid(
                "webhooks.max_concurrent_sends and webhooks.channel_capacity must be at least 1".to_string(),
            );
        }
        if self.webhooks.claim_batch_size == 0 {
            return invalid("webhooks.claim_batch_size must be at least 1".to_string());
        }
        if let Err(e) = humantime::parse_duration(&self.default_completion_window) {
            return invalid(format!(
                "default_completion_window '{}' is not a duration: {}",
                self.default_completion_window, e
            ));
        }
        if let Err(e) = url::Url::parse(&self.engine.base_url) {
            return invalid(format!("engine.base_url '{}' is not a URL: {}", self.engine.base_url, e));
        }
        self.webhooks.signer()?;

        Ok(())
    }
}
