//! Webhook notifications for job status changes.
//!
//! - [`signing`]: optional HMAC-SHA256 signatures per Standard Webhooks
//! - [`events`]: the payload posted for each status change
//! - [`dispatcher`]: claim/sign/send/result loop with retry and backoff

pub mod dispatcher;
pub mod events;
pub mod signing;

pub use dispatcher::{WebhookConfig, WebhookDispatcher};
pub use events::WebhookPayload;
pub use signing::Signer;
