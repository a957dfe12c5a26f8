//! Error types for the streaming server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for streaming server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for streaming server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request (query parameters, missing upgrade)
    #[error("{0}")]
    BadRequest(String),

    /// No offered sub-protocol is supported
    #[error(transparent)]
    Negotiation(#[from] crate::channel::protocol::NegotiationError),

    /// The caller cancelled the session
    #[error("session cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::Negotiation(_) => StatusCode::BAD_REQUEST,
            Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Error::BadRequest(_) | Error::Negotiation(_) => "BadRequest",
            Error::Cancelled => "ServiceUnavailable",
            Error::Config(_) | Error::Internal(_) => "InternalError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Kubernetes-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<podlet_exec::Error> for Error {
    fn from(e: podlet_exec::Error) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Internal(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
