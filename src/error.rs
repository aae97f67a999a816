use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;
use crate::model::RoomId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing or invalid identity")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("room {room_id} is already booked for an overlapping period")]
    Overbooking { room_id: RoomId },

    #[error("invalid status transition: {0}")]
    InvalidStatusTransition(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: Decimal, received: String },

    #[error("record is locked, retry later")]
    LockUnavailable,

    #[error("storage deadline exceeded")]
    StorageTimeout,

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Unauthenticated => "UNAUTHENTICATED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Overbooking { .. } => "BOOKING_CONFLICT",
            Error::InvalidStatusTransition(_) => "INVALID_STATUS_TRANSITION",
            Error::InvalidSignature => "INVALID_SIGNATURE",
            Error::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Error::LockUnavailable => "LOCK_UNAVAILABLE",
            Error::StorageTimeout => "STORAGE_TIMEOUT",
            Error::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::InvalidStatusTransition(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) | Error::InvalidSignature | Error::AmountMismatch { .. } => {
                StatusCode::FORBIDDEN
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Overbooking { .. } => StatusCode::CONFLICT,
            Error::LockUnavailable | Error::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for Error {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(what) => Error::NotFound(what),
            EngineError::Overlap { room_id, .. } => Error::Overbooking { room_id },
            EngineError::LockTimeout => Error::LockUnavailable,
            EngineError::LimitExceeded(msg) => Error::Validation(msg.to_string()),
            other @ (EngineError::AlreadyExists(_) | EngineError::WalError(_)) => {
                Error::Storage(other.to_string())
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Error::Storage(detail) => {
                tracing::error!(error = %detail, "storage failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}
