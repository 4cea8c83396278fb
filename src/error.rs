//! Failure taxonomy of the chat pipeline and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Why the generation call did not produce text.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request to generation backend failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed generation response: {0}")]
    Decode(String),
    #[error("generation timed out after {0} ms")]
    Timeout(u64),
    #[error("{0}")]
    Backend(String),
}

/// Terminal failure of one chat request.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("LLM service is not available: {0}")]
    Configuration(String),
    #[error("Simulated failure for testing")]
    SimulatedFailure,
    #[error("LLM generation failed: {0}")]
    Generation(#[source] GenerationError),
    #[error("Internal server error")]
    Unexpected(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Configuration(_) => "configuration_error",
            ChatError::SimulatedFailure => "simulated_failure",
            ChatError::Generation(_) => "generation_error",
            ChatError::Unexpected(_) => "unexpected_error",
        }
    }

    /// Full cause for logs; for `Unexpected` this is richer than `Display`.
    pub fn cause(&self) -> String {
        match self {
            ChatError::Unexpected(cause) => cause.clone(),
            other => other.to_string(),
        }
    }

    pub fn into_response_for(self, request_id: Option<String>) -> Response {
        let body = ErrorResponse {
            error: self.kind(),
            detail: self.to_string(),
            http_status: self.status().as_u16(),
            request_id,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        self.into_response_for(None)
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: &'static str,
    pub detail: String,
    pub http_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
