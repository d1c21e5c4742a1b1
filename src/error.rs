use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required: {0}")]
    Unauthenticated(String),
    #[error("forbidden")]
    Forbidden,
    #[error("event not found")]
    NotFound,
    #[error("identity provider error: {0}")]
    Identity(String),
    #[error("storage backend error: {0}")]
    Storage(String),
    #[error("request cancelled or timed out")]
    Cancelled,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AuditError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Identity(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::Config(_) | Self::Storage(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_kinds_to_status_codes() {
        let cases = [
            (
                AuditError::BadRequest("bad".into()).into_response(),
                StatusCode::BAD_REQUEST,
            ),
            (
                AuditError::Unauthenticated("no token".into()).into_response(),
                StatusCode::UNAUTHORIZED,
            ),
            (AuditError::Forbidden.into_response(), StatusCode::FORBIDDEN),
            (AuditError::NotFound.into_response(), StatusCode::NOT_FOUND),
            (
                AuditError::Storage("down".into()).into_response(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AuditError::Identity("down".into()).into_response(),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (response, expected) in cases {
            assert_eq!(response.status(), expected);
        }
    }
}
