//! Shared HTTP plumbing for the Google API bindings

use pipeline_core::{PipelineError, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Per-request timeout for Google API calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the HTTP client shared by the API bindings
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::config(format!("cannot build HTTP client: {}", e)))
}

/// Map a reqwest failure onto the error taxonomy
pub fn transport_error(e: reqwest::Error) -> PipelineError {
    match e.status() {
        Some(status) => PipelineError::api(status.as_u16(), e.to_string()),
        None if e.is_decode() => PipelineError::invalid_response(e.to_string()),
        None => PipelineError::transport(e.to_string()),
    }
}

/// Error for a non-success response, using the Google error message if present
pub fn status_error(status: u16, body: &str) -> PipelineError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().chars().take(512).collect());
    PipelineError::api(status, message)
}

/// Decode a JSON response, mapping non-success statuses to API errors
pub async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(status_error(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| {
        PipelineError::invalid_response(format!("cannot decode response: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_uses_google_message() {
        let body = r#"{"error": {"code": 403, "message": "Permission denied on project", "status": "PERMISSION_DENIED"}}"#;
        match status_error(403, body) {
            PipelineError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Permission denied on project");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_error_plain_body() {
        let err = status_error(503, "  upstream unavailable \n");
        assert!(err.is_transient());
        assert!(err.to_string().contains("upstream unavailable"));
    }
}
