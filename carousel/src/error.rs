use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, CarouselError>;

/// Errors that can occur in the orchestrator.
#[derive(Debug, Error)]
pub enum CarouselError {
    /// The input collection contained no requests.
    #[error("Input {input_ref} contains no requests")]
    EmptyInput { input_ref: String },

    /// A line of the input collection could not be accepted.
    #[error("Malformed request on line {line}: {message}")]
    MalformedRequest {
        line: usize,
        message: String,
        content: String,
    },

    /// Admission parameters (completion window, webhook URL) were rejected.
    #[error("Invalid job parameters: {0}")]
    InvalidParameters(String),

    /// The engine could not load the model a job needs.
    #[error("Failed to load model {model}: {message}")]
    ModelLoad { model: String, message: String },

    /// The requested edge is not part of the job state machine.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// A request outcome was recorded twice.
    #[error("Result for request {custom_id} of job {job_id} is already recorded")]
    DuplicateResult { job_id: JobId, custom_id: String },

    /// The job is terminal (or past the point of cancelling) and can no longer be changed.
    #[error("Job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Request not found within its job
    #[error("Request {custom_id} not found in job {job_id}")]
    RequestNotFound { job_id: JobId, custom_id: String },

    /// A result handler failed during finalization.
    #[error("Result handler {handler} failed: {message}")]
    Handler { handler: String, message: String },

    /// A webhook delivery attempt failed.
    #[error("Webhook delivery failed: {0}")]
    WebhookDelivery(String),

    /// Reading or writing a blob failed.
    #[error("Blob storage error: {0}")]
    Blob(String),

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CarouselError {
    /// Validation errors are reported synchronously at admission.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CarouselError::EmptyInput { .. }
                | CarouselError::MalformedRequest { .. }
                | CarouselError::InvalidParameters(_)
        )
    }

    /// Short machine-readable code, stored alongside failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            CarouselError::EmptyInput { .. } => "empty_input",
            CarouselError::MalformedRequest { .. } => "malformed_request",
            CarouselError::InvalidParameters(_) => "invalid_parameters",
            CarouselError::ModelLoad { .. } => "model_load_error",
            CarouselError::InvalidTransition { .. } => "invalid_transition",
            CarouselError::DuplicateResult { .. } => "duplicate_result",
            CarouselError::AlreadyTerminal { .. } => "already_terminal",
            CarouselError::JobNotFound(_) => "job_not_found",
            CarouselError::RequestNotFound { .. } => "request_not_found",
            CarouselError::Handler { .. } => "handler_error",
            CarouselError::WebhookDelivery(_) => "webhook_delivery_error",
            CarouselError::Blob(_) => "blob_error",
            #[cfg(feature = "postgres")]
            CarouselError::Database(_) => "database_error",
            CarouselError::Json(_) => "json_error",
            CarouselError::Io(_) => "io_error",
            CarouselError::Other(_) => "internal_error",
        }
    }
}
