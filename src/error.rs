use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;
use tracing::error;

use crate::{
    crm::CrmError,
    queue::QueueError,
    repository::RepositoryError,
    storage::StorageError,
    variables::VariableError,
};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message, "request failed");
        }
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<RepositoryError> for AppError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => AppError::not_found(),
            RepositoryError::Conflict(message) => AppError::conflict(message),
            err @ RepositoryError::InvalidTransition { .. } => AppError::conflict(err.to_string()),
            other => AppError::internal(other),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::NotReady(_) => AppError::service_unavailable(
                "job queue is temporarily unavailable; please retry shortly",
            ),
            err @ QueueError::UnknownQueue(_) => AppError::bad_request(err.to_string()),
            QueueError::NotFound => AppError::not_found(),
            other => AppError::internal(other),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(_) => AppError::not_found(),
            err @ StorageError::InvalidPath(_) => AppError::bad_request(err.to_string()),
            other => AppError::internal(other),
        }
    }
}

impl From<CrmError> for AppError {
    fn from(value: CrmError) -> Self {
        match value {
            CrmError::NotFound => AppError::not_found(),
            err @ (CrmError::Unauthorized | CrmError::Token(_)) => {
                AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            err @ CrmError::RateLimited { .. } => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            other => AppError::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

impl From<VariableError> for AppError {
    fn from(value: VariableError) -> Self {
        AppError::bad_request(value.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::bad_request(value.to_string())
    }
}
