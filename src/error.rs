//! Endpoint errors and their HTTP rendering.

use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
};
use quick_xml::escape::escape;
use thiserror::Error;
use tracing::error;

use crate::mapping::MappingError;

/// Result type for SAML endpoint handlers.
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Errors raised while serving a SAML endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Path segment under `auth/saml/` that we do not serve
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Generated SP metadata failed validation
    #[error("{0}")]
    InvalidMetadata(String),

    /// The IdP Response was rejected
    #[error("Not authenticated")]
    NotAuthenticated(Vec<String>),

    /// Assertion attributes could not be mapped (debug mode only)
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// A logout message failed validation
    #[error("{}", .0.join(", "))]
    LogoutRejected(Vec<String>),

    /// A logout message could not be decoded or parsed
    #[error("An error occurred during logout: {0}")]
    MalformedLogout(String),

    /// Session storage or message construction failed
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        match self {
            EndpointError::UnknownEndpoint(_) => (
                StatusCode::NOT_FOUND,
                [(header::CONTENT_TYPE, "text/plain")],
                self.to_string(),
            )
                .into_response(),
            EndpointError::InvalidMetadata(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                message,
            )
                .into_response(),
            EndpointError::NotAuthenticated(errors) => {
                let body = format!(
                    "<p>{}</p><p>Not authenticated</p>",
                    escape(&errors.join(", "))
                );
                (StatusCode::UNAUTHORIZED, Html(body)).into_response()
            }
            EndpointError::Mapping(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("<p>{}</p>", escape(&e.to_string()))),
            )
                .into_response(),
            EndpointError::LogoutRejected(errors) => (
                StatusCode::BAD_REQUEST,
                Html(format!("<p>{}</p>", escape(&errors.join(", ")))),
            )
                .into_response(),
            EndpointError::MalformedLogout(message) => (
                StatusCode::BAD_REQUEST,
                Html(format!(
                    "<p>An error occurred during logout</p><p>{}</p>",
                    escape(&message)
                )),
            )
                .into_response(),
            EndpointError::Internal(e) => {
                error!(error = %e, "SAML endpoint failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
