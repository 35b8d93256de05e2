use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised by the engine clients and surfaced by the workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The local face model could not be loaded or is not ready.
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote service answered with a non-success status.
    #[error("service returned {status}: {message}")]
    Service { status: StatusCode, message: String },

    #[error("malformed service response: {0}")]
    MalformedResponse(String),

    #[error("invalid image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no match at index {index} (have {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("upload batch is empty")]
    EmptyBatch,

    #[error("folder name is not set")]
    MissingFolderName,
}

impl WorkflowError {
    /// Build a `Service` error from a failed response, preferring the `error`
    /// field of a JSON body over the raw text.
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                } else {
                    trimmed.to_string()
                }
            });
        WorkflowError::Service { status, message }
    }
}
