//! Error taxonomy for the catalog and subscription core.
//!
//! Validation failures at the request boundary map to structured 4xx JSON
//! responses; soft conditions (predicate evaluation failures, full send
//! queues) are handled in place and never reach this type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown instrument or subscription.
    #[error("{0} not found")]
    NotFound(String),
    /// Duplicate instrument id on insert.
    #[error("instrument {0} already exists")]
    AlreadyExists(String),
    /// Unknown enumeration, malformed predicate, empty id list, bad field value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::InvalidArgument(_) => "invalid_argument",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CoreError::not_found("instrument X").kind(), "not_found");
        assert_eq!(
            CoreError::AlreadyExists("US10Y".into()).kind(),
            "already_exists"
        );
        assert_eq!(CoreError::invalid("empty id list").kind(), "invalid_argument");
    }

    #[test]
    fn test_error_messages() {
        let err = CoreError::not_found("subscription abc");
        assert_eq!(err.to_string(), "subscription abc not found");
        let err = CoreError::AlreadyExists("US10Y".into());
        assert_eq!(err.to_string(), "instrument US10Y already exists");
    }
}
