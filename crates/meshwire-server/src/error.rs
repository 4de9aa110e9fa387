//! Coordinator error types and their HTTP / gRPC mappings.
//!
//! Every handler classifies failures into one of these kinds before the
//! error crosses a service boundary; the transport layers translate the
//! kind, never the message, into status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::storage::StoreError;

/// Coordinator result type alias.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad input from a caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad token or password.
    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    /// Valid caller, wrong resource.
    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No live stream for the target node.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Deadline exceeded.
    #[error("Deadline exceeded: {0}")]
    Exhausted(String),

    /// Network-level failure on an outbound send.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The store reported an impossible state. Never swallowed.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Exhausted(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) | Self::Integrity(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Map to a gRPC status. Message detail survives the boundary except
    /// for internal kinds, which are masked.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            Self::Validation(m) => tonic::Status::invalid_argument(m.clone()),
            Self::Unauthenticated(m) => tonic::Status::unauthenticated(m.clone()),
            Self::Forbidden(m) => tonic::Status::permission_denied(m.clone()),
            Self::NotFound(m) => tonic::Status::not_found(m.clone()),
            Self::Conflict(m) => tonic::Status::already_exists(m.clone()),
            Self::Unavailable(m) => tonic::Status::unavailable(m.clone()),
            Self::Exhausted(m) => tonic::Status::deadline_exceeded(m.clone()),
            Self::Transport(_) | Self::Integrity(_) | Self::Internal(_) => {
                tonic::Status::internal("internal error")
            }
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => Self::NotFound(m),
            StoreError::Conflict(m) => Self::Conflict(m),
            StoreError::Integrity(m) => Self::Integrity(m),
            StoreError::Backend(m) => Self::Internal(m),
        }
    }
}

impl From<ServerError> for tonic::Status {
    fn from(e: ServerError) -> Self {
        e.to_status()
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        // Internal details stay in the log, not in the response body.
        let message = match &self {
            Self::Transport(_) | Self::Integrity(_) | Self::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        let e: ServerError = StoreError::NotFound("node 3".into()).into();
        assert!(matches!(e, ServerError::NotFound(_)));

        let e: ServerError = StoreError::Conflict("duplicate".into()).into();
        assert!(matches!(e, ServerError::Conflict(_)));
    }

    #[test]
    fn grpc_codes() {
        assert_eq!(
            ServerError::Unauthenticated("x".into()).to_status().code(),
            tonic::Code::Unauthenticated
        );
        assert_eq!(
            ServerError::NotFound("x".into()).to_status().code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            ServerError::Unavailable("x".into()).to_status().code(),
            tonic::Code::Unavailable
        );
        // Internal detail is masked
        let status = ServerError::Internal("secret".into()).to_status();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(!status.message().contains("secret"));
    }

    #[test]
    fn http_statuses() {
        assert_eq!(
            ServerError::Conflict("x".into()).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServerError::Unavailable("x".into()).http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::Exhausted("x".into()).http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
