use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clinicsync_core::remote::protocol::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// The store refused the statement (constraint, missing column, ...).
    #[error("Rejected by store: {0}")]
    Rejected(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Rejected(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<clinicsync_core::Error> for AppError {
    fn from(error: clinicsync_core::Error) -> Self {
        use clinicsync_core::Error;
        match error {
            Error::Validation(message) | Error::NotFound(message) => Self::BadRequest(message),
            Error::RemoteUnavailable(message) => Self::Unavailable(message),
            Error::Remote(message) => Self::Rejected(message),
            Error::Config(message) => Self::Config(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
