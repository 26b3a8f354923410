use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

/// Every failure an operation can hand back to the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user not found")]
    NotFound,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    ExpiredToken,
    #[error("malformed token")]
    MalformedToken,
    #[error("missing token")]
    MissingToken,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials
            | AppError::NotFound
            | AppError::InvalidToken
            | AppError::ExpiredToken
            | AppError::MalformedToken
            | AppError::MissingToken => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Tampered and malformed tokens read the same.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) | AppError::Conflict(msg) => msg.clone(),
            AppError::InvalidCredentials => "Invalid user credentials".into(),
            AppError::NotFound => "User does not exist".into(),
            AppError::InvalidToken | AppError::MalformedToken => "Invalid token".into(),
            AppError::ExpiredToken => "Token expired".into(),
            AppError::MissingToken => "Unauthorized request".into(),
            AppError::StoreUnavailable(_) => "Service temporarily unavailable".into(),
            AppError::Internal(_) => "Internal server error".into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Internal(e) => error!(error = ?e, "internal error"),
            AppError::StoreUnavailable(detail) => warn!(%detail, "upstream unavailable"),
            _ => {}
        }

        let status = self.status_code();
        let mut response = (
            status,
            Json(ErrorResponse {
                success: false,
                error: self.public_message(),
            }),
        )
            .into_response();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
