use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use session_manager::SessionError;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Session(e) => e.error_code(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Session(e) => match e {
                SessionError::InvalidInstanceId(_) => StatusCode::BAD_REQUEST,
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::NotInitialized(_) | SessionError::PairingCapExceeded(_) => {
                    StatusCode::CONFLICT
                }
                SessionError::CredentialIo { .. }
                | SessionError::CredentialFormat { .. }
                | SessionError::Transport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            success: false,
            error: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), "{}", self);
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}
