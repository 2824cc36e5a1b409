//! OAuth2 error responses.
//!
//! Machine-facing endpoints always answer with the RFC 6749 error body
//! `{"error": "...", "error_description": "..."}`. Browser-facing failures
//! are rendered by the handlers instead and never reach this mapping.

use crate::connector::ConnectorError;
use crate::signer::SignerError;
use crate::storage::StorageError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidClient(String),
    #[error("{0}")]
    InvalidGrant(String),
    #[error("{0}")]
    InvalidScope(String),
    #[error("{0}")]
    UnauthorizedClient(String),
    #[error("unsupported grant type {0:?}")]
    UnsupportedGrantType(String),
    #[error("polling too quickly")]
    SlowDown,
    #[error("authorization pending")]
    AuthorizationPending,
    #[error("device code expired")]
    ExpiredToken,
    #[error("{0}")]
    ServerError(String),
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::InvalidRequest(_) => "invalid_request",
            TokenError::InvalidClient(_) => "invalid_client",
            TokenError::InvalidGrant(_) => "invalid_grant",
            TokenError::InvalidScope(_) => "invalid_scope",
            TokenError::UnauthorizedClient(_) => "unauthorized_client",
            TokenError::UnsupportedGrantType(_) => "unsupported_grant_type",
            TokenError::SlowDown => "slow_down",
            TokenError::AuthorizationPending => "authorization_pending",
            TokenError::ExpiredToken => "expired_token",
            TokenError::ServerError(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            TokenError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            TokenError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    error_description: &'a str,
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        if let TokenError::ServerError(detail) = &self {
            // The detail stays in the logs; clients get an opaque error.
            error!("Internal error serving token request: {}", detail);
        }
        let description = match &self {
            TokenError::ServerError(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let body = Json(ErrorBody {
            error: self.code(),
            error_description: &description,
        });
        let mut response = (self.status(), body).into_response();
        if matches!(self, TokenError::InvalidClient(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Basic realm=\"varlock\""),
            );
        }
        response
    }
}

impl From<StorageError> for TokenError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => TokenError::InvalidGrant("not found".to_string()),
            other => TokenError::ServerError(other.to_string()),
        }
    }
}

impl From<SignerError> for TokenError {
    fn from(err: SignerError) -> Self {
        TokenError::ServerError(err.to_string())
    }
}

impl From<ConnectorError> for TokenError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::UserGone => {
                TokenError::InvalidGrant("upstream identity no longer exists".to_string())
            }
            ConnectorError::Unsupported => {
                TokenError::InvalidRequest("operation not supported by this connector".to_string())
            }
            other => TokenError::ServerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_rfc6749() {
        assert_eq!(TokenError::SlowDown.code(), "slow_down");
        assert_eq!(TokenError::AuthorizationPending.code(), "authorization_pending");
        assert_eq!(TokenError::ExpiredToken.code(), "expired_token");
        assert_eq!(TokenError::InvalidGrant("x".into()).code(), "invalid_grant");
        assert_eq!(
            TokenError::UnsupportedGrantType("x".into()).code(),
            "unsupported_grant_type"
        );
    }

    #[test]
    fn not_found_maps_to_invalid_grant() {
        let err: TokenError = StorageError::NotFound.into();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[test]
    fn backend_errors_map_to_server_error() {
        let err: TokenError = StorageError::Internal("db gone".into()).into();
        assert_eq!(err.code(), "server_error");
        let err: TokenError = SignerError::NoSigningKey.into();
        assert_eq!(err.code(), "server_error");
    }

    #[test]
    fn gone_upstream_users_are_invalid_grant() {
        let err: TokenError = ConnectorError::UserGone.into();
        assert_eq!(err.code(), "invalid_grant");
        let err: TokenError = ConnectorError::Upstream("timeout".into()).into();
        assert_eq!(err.code(), "server_error");
    }
}
