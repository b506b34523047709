//! OpenAI batch JSONL format.
//!
//! Input lines look like
//! `{"custom_id": "r1", "method": "POST", "url": "/v1/chat/completions", "body": {...}}`;
//! output lines like
//! `{"id": "...", "custom_id": "r1", "response": {"status_code": 200, "body": {...}}, "error": null}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CarouselError, Result};
use crate::job::{BatchRequest, JobId, RequestOutcome};

/// Offending content is truncated to this many characters in errors.
const MAX_ERROR_CONTENT: usize = 200;

#[derive(Debug, Deserialize)]
struct InputLine {
    custom_id: Option<serde_json::Value>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_url")]
    url: String,
    body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_url() -> String {
    "/v1/chat/completions".to_string()
}

fn malformed(line: usize, message: impl Into<String>, content: &str) -> CarouselError {
    CarouselError::MalformedRequest {
        line,
        message: message.into(),
        content: content.chars().take(MAX_ERROR_CONTENT).collect(),
    }
}

/// Parse and validate an input collection.
///
/// Blank lines are skipped; line numbers in errors are 1-based physical lines. When `model` is
/// given, a `body.model` that names a different model is rejected.
pub fn parse_requests(
    input_ref: &str,
    contents: &[u8],
    model: Option<&str>,
) -> Result<Vec<BatchRequest>> {
    let text = std::str::from_utf8(contents)
        .map_err(|e| malformed(1, format!("Input must be valid UTF-8 text: {}", e), ""))?;

    let mut requests = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        let parsed: InputLine = serde_json::from_str(trimmed)
            .map_err(|e| malformed(line, format!("Invalid JSON: {}", e), trimmed))?;

        let custom_id = match parsed.custom_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id,
            Some(serde_json::Value::String(_)) | None => {
                return Err(malformed(line, "Missing custom_id", trimmed));
            }
            Some(_) => return Err(malformed(line, "custom_id must be a string", trimmed)),
        };

        if let Some(first) = seen.insert(custom_id.clone(), line) {
            return Err(malformed(
                line,
                format!(
                    "Duplicate custom_id '{}' (first used on line {})",
                    custom_id, first
                ),
                trimmed,
            ));
        }

        let body = match parsed.body {
            Some(body @ serde_json::Value::Object(_)) => body,
            Some(_) => return Err(malformed(line, "body must be a JSON object", trimmed)),
            None => return Err(malformed(line, "Missing body", trimmed)),
        };

        if let (Some(expected), Some(found)) = (model, body.get("model")) {
            if found.as_str() != Some(expected) {
                return Err(malformed(
                    line,
                    format!("body.model {} does not match job model '{}'", found, expected),
                    trimmed,
                ));
            }
        }

        requests.push(BatchRequest {
            custom_id,
            line: line as i64,
            method: parsed.method.to_uppercase(),
            url: parsed.url,
            body,
            outcome: None,
            resolved_at: None,
        });
    }

    if requests.is_empty() {
        return Err(CarouselError::EmptyInput {
            input_ref: input_ref.to_string(),
        });
    }

    tracing::debug!(input_ref, total = requests.len(), "Parsed input collection");
    Ok(requests)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputError {
    pub message: String,
}

/// One line of the result collection.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputLine {
    pub id: String,
    pub custom_id: String,
    pub response: Option<OutputResponse>,
    pub error: Option<OutputError>,
}

impl OutputLine {
    pub fn new(job_id: JobId, request: &BatchRequest) -> Self {
        let (response, error) = match &request.outcome {
            Some(RequestOutcome::Response { status_code, body }) => (
                Some(OutputResponse {
                    status_code: *status_code,
                    body: body.clone(),
                }),
                None,
            ),
            Some(RequestOutcome::Error { message }) => (
                None,
                Some(OutputError {
                    message: message.clone(),
                }),
            ),
            None => (
                None,
                Some(OutputError {
                    message: "Request was not processed".to_string(),
                }),
            ),
        };

        Self {
            id: format!("batch_req_{}_{}", job_id.simple(), request.line),
            custom_id: request.custom_id.clone(),
            response,
            error,
        }
    }
}

/// Render the result collection, in input order.
pub fn render_results(job_id: JobId, requests: &[BatchRequest]) -> Result<Vec<u8>> {
    let mut ordered: Vec<&BatchRequest> = requests.iter().collect();
    ordered.sort_by_key(|r| r.line);

    let mut out = Vec::new();
    for request in ordered {
        serde_json::to_writer(&mut out, &OutputLine::new(job_id, request))?;
        out.push(b'\n');
    }
    Ok(out)
}
