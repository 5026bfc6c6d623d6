//! Error responses for the agent service.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use forgeline::io::generator::TransportError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown role '{0}'")]
    UnknownRole(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The generator failed and no envelope could be produced.
    #[error("generator unavailable: {0}")]
    Upstream(String),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_type: &'static str,
    pub human_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownRole(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::UnknownRole(_) => "unknown_role",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn human_message(&self) -> String {
        match self {
            ApiError::UnknownRole(role) => format!("No agent is registered for role '{role}'."),
            ApiError::BadRequest(_) => {
                "The request body is not a valid message envelope.".to_string()
            }
            ApiError::Upstream(_) => {
                "The language model could not be reached. Try again shortly.".to_string()
            }
            ApiError::Internal(_) => "The agent failed unexpectedly.".to_string(),
        }
    }
}

/// Transport failures anywhere in the chain become 502s; the rest are 500s.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if err.chain().any(|cause| cause.is::<TransportError>()) {
            ApiError::Upstream(format!("{err:#}"))
        } else {
            ApiError::Internal(err)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, error = %self, "request failed");
        } else {
            warn!(status = %status, error = %self, "request rejected");
        }
        let traceback = match &self {
            ApiError::Internal(err) => Some(format!("{err:?}")),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            error_type: self.error_type(),
            human_message: self.human_message(),
            traceback,
        };
        (status, Json(body)).into_response()
    }
}
