//! Error types for the pipeline runner

use thiserror::Error;

/// Core error type for pipeline runner operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network, TLS or timeout failure talking to a remote API
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote API answered with a non-success status
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A required object-storage input is missing
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// Submission kept failing after every transport retry
    #[error("Submission failed after {attempts} attempt(s): {source}")]
    SubmissionFailed {
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// Status polling kept failing, remote state is unknown
    #[error("Polling {name} failed after {failures} consecutive failure(s): {source}")]
    PollingFailed {
        name: String,
        failures: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create an API error from an HTTP status and body
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether a local retry may clear this error.
    ///
    /// Rate limiting, server errors and expired credentials (401) count as
    /// transient; every other API status is deterministic.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 401 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::transport("connection reset").is_transient());
        assert!(PipelineError::api(503, "unavailable").is_transient());
        assert!(PipelineError::api(429, "slow down").is_transient());
        assert!(PipelineError::api(401, "token expired").is_transient());

        assert!(!PipelineError::api(400, "bad request").is_transient());
        assert!(!PipelineError::api(404, "not found").is_transient());
        assert!(!PipelineError::config("PROJECT_ID").is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }

    #[test]
    fn test_wrapped_errors_are_not_transient() {
        let err = PipelineError::SubmissionFailed {
            attempts: 6,
            source: Box::new(PipelineError::transport("timeout")),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("6 attempt(s)"));
    }
}
