//! Error taxonomy shared by the sandbox host and the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed identifier, URL or request body.
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("Forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// A workspace id resolved outside the confinement root.
    #[error("Path traversal attempt detected: {0}")]
    Traversal(String),
    /// The sandbox host could not be reached at all.
    #[error("{0}")]
    Unreachable(String),
    #[error("{0}")]
    Timeout(String),
    #[error("Command failed (exit {code}): {output}")]
    ProcessFailed { code: i32, output: String },
    #[error("{0}")]
    Unprocessable(String),
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Terminal error: {0}")]
    Pty(String),
    /// The sandbox host answered, but with an error.
    #[error("{0}")]
    Upstream(String),
    #[error("WebSocket upgrade required")]
    UpgradeRequired,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) | Error::Traversal(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Unreachable(_) | Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ProcessFailed { .. } | Error::Unprocessable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Error::Spawn { .. } | Error::Pty(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
