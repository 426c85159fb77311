use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::result::ApiResult;
use crate::utils::error_codes;

#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    Forbidden,
    InvalidMessage(String),
    Database(sqlx::Error),
    InternalServerError,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error_message) = match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                error_codes::AUTH_FAILED,
                "unauthorized".to_string(),
            ),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                error_codes::PERMISSION_DENIED,
                "forbidden".to_string(),
            ),
            AppError::InvalidMessage(reason) => (
                StatusCode::BAD_REQUEST,
                error_codes::VALIDATION_ERROR,
                format!("invalid message: {}", reason),
            ),
            AppError::Database(e) => {
                tracing::error!(error = %e, "database query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_codes::DATABASE_ERROR,
                    "database unavailable".to_string(),
                )
            }
            AppError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_codes::INTERNAL_ERROR,
                "internal server error".to_string(),
            ),
        };

        (status, Json(ApiResult::<()>::error(code, error_message))).into_response()
    }
}
