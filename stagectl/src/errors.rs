use crate::{
    db::errors::DbError,
    jobs::JobStatus,
    types::{JobId, ReservationId},
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed amount or input, rejected before any side effect
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Insufficient credits: {required} required, {available} available ({missing} missing)")]
    InsufficientCredits { required: i64, available: i64, missing: i64 },

    #[error("External provider error: {message}")]
    ExternalProvider { message: String },

    #[error("Artifact storage error: {message}")]
    Storage { message: String },

    /// The costed work succeeded but its reservation could not be settled.
    /// Requires reconciliation; never reported as success.
    #[error("Operation succeeded but billing failed for reservation {reservation_id}: {message}")]
    ReservationConfirmation { reservation_id: ReservationId, message: String },

    #[error("A pending reservation already exists for {operation_tag}")]
    ReservationHeld { operation_tag: String },

    #[error("Cannot {action} job {job_id} in state {status}")]
    InvalidJobState {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("{resource} with id {id} not found")]
    NotFound { resource: String, id: String },

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("Internal error while trying to {operation}")]
    Internal { operation: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn insufficient_credits(required: i64, available: i64) -> Self {
        Error::InsufficientCredits {
            required,
            available,
            missing: (required - available).max(0),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        Error::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::ExternalProvider { .. } | Error::Storage { .. } => StatusCode::BAD_GATEWAY,
            Error::ReservationConfirmation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ReservationHeld { .. } | Error::InvalidJobState { .. } => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::Database(DbError::NotFound) => StatusCode::NOT_FOUND,
            Error::Database(DbError::UniqueViolation { .. }) => StatusCode::CONFLICT,
            Error::Database(_) | Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::InsufficientCredits { .. } => "insufficient_credits",
            Error::ExternalProvider { .. } => "external_provider_error",
            Error::Storage { .. } => "storage_error",
            Error::ReservationConfirmation { .. } => "reservation_confirmation_error",
            Error::ReservationHeld { .. } => "reservation_held",
            Error::InvalidJobState { .. } => "invalid_job_state",
            Error::NotFound { .. } => "not_found",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden { .. } => "forbidden",
            Error::Database(_) => "database_error",
            Error::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, "request rejected");
        }

        // Don't leak database internals to callers
        let message = match &self {
            Error::Database(_) => "A database error occurred".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({
            "error": self.kind(),
            "message": message,
        });
        if let Error::InsufficientCredits {
            required,
            available,
            missing,
        } = &self
        {
            body["required"] = json!(required);
            body["available"] = json!(available);
            body["missing"] = json!(missing);
        }

        (status, Json(body)).into_response()
    }
}
