use actions_core::ActionsError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

// ---------------------------------------------------------------------------
// Sentinels for request-level failures
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BadRequest(String);

impl std::fmt::Display for BadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequest {}

#[derive(Debug)]
struct NotFound(String);

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFound {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses. Bodies are `{"error": "..."}`.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequest(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFound(msg.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequest>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        if self.0.downcast_ref::<NotFound>().is_some() {
            return StatusCode::NOT_FOUND;
        }
        let Some(e) = self.0.downcast_ref::<ActionsError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match e {
            ActionsError::ActionNotFound(_)
            | ActionsError::RunNotFound(_)
            | ActionsError::PayloadNotFound(_) => StatusCode::NOT_FOUND,
            ActionsError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ActionsError::MalformedEncoding
            | ActionsError::MalformedPayload(_)
            | ActionsError::UnsupportedAlgorithm(_)
            | ActionsError::DecryptionFailed
            | ActionsError::MissingSecret(_) => StatusCode::BAD_REQUEST,
            ActionsError::InvalidKeyConfig(_)
            | ActionsError::InvalidConfig(_)
            | ActionsError::InvalidManifest(_)
            | ActionsError::CommandNotFound { .. }
            | ActionsError::RunDb(_)
            | ActionsError::MigrationPending { .. }
            | ActionsError::UnsupportedSchema(_)
            | ActionsError::HomeNotFound
            | ActionsError::Io(_)
            | ActionsError::Yaml(_)
            | ActionsError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
