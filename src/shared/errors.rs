//! API error taxonomy.
//!
//! Every handler returns `Result<_, ApiError>`; the error is rendered as the
//! uniform envelope `{"error": {"code": ..., "message": ...}}` with the
//! matching HTTP status. Cache failures in the idempotency and rate-limit
//! paths are handled locally (fail open) and never reach this type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    FieldRequired(String),
    #[error("Ticket version is required for updates.")]
    VersionRequired,
    #[error("Invalid ticket ID format")]
    InvalidId,
    #[error("Not authorized, no token")]
    NoToken,
    #[error("{0}")]
    NotAuthorized(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Ticket has been modified by someone else. Please refresh and try again.")]
    Conflict,
    #[error("User with this email or username already exists.")]
    UserExists,
    #[error("Too many requests. Please try again later.")]
    RateLimit,
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::FieldRequired(_) => "FIELD_REQUIRED",
            Self::VersionRequired => "VERSION_REQUIRED",
            Self::InvalidId => "INVALID_ID",
            Self::NoToken => "NO_TOKEN",
            Self::NotAuthorized(_) => "NOT_AUTHORIZED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::UserExists => "USER_EXISTS",
            Self::RateLimit => "RATE_LIMIT",
            Self::Internal(_) => "SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::FieldRequired(_) | Self::VersionRequired | Self::InvalidId => {
                StatusCode::BAD_REQUEST
            }
            Self::NoToken | Self::NotAuthorized(_) | Self::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict | Self::UserExists => StatusCode::CONFLICT,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref source) = self {
            error!("internal error: {source:#}");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Internal(anyhow::anyhow!("database error: {err}"))
    }
}

impl From<diesel::r2d2::PoolError> for ApiError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Internal(anyhow::anyhow!("connection pool error: {err}"))
    }
}
