#![forbid(unsafe_code)]

//! Error taxonomy for the retrieval gateway and its mapping onto HTTP.
//!
//! Everything that can go wrong before the response headers are committed is
//! a [`GatewayError`] and ends up as a structured JSON body. Once bytes are on
//! the wire the only signal left is truncating the stream, see
//! [`crate::relay`].

use std::io;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::format::FormatError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or malformed `url`/`format` query parameters.
    #[error("{reason}")]
    InvalidRequest { reason: String },

    #[error("unsupported format '{token}'")]
    InvalidFormat { token: String },

    /// The extraction binary could not be launched at all.
    #[error("failed to launch extractor '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    /// The extractor ran but did not produce a usable stream.
    #[error("{message}")]
    ExtractionFailure {
        message: String,
        details: Option<String>,
    },

    #[error("too many concurrent extractions (limit {limit})")]
    ResourceExhausted { limit: usize },

    /// Gateway-side misconfiguration discovered while handling a request.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn extraction_failure(message: impl Into<String>, details: Option<String>) -> Self {
        Self::ExtractionFailure {
            message: message.into(),
            details,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidFormat { .. } => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Spawn { .. }
            | Self::ExtractionFailure { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FormatError> for GatewayError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::InvalidFormat { token } => Self::InvalidFormat { token },
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl ApiError {
    /// Creates a 404 error with the provided message.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        let message = err.to_string();
        let details = match err {
            GatewayError::ExtractionFailure { details, .. } => details,
            _ => None,
        };
        Self {
            status,
            message,
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            details: self.details.as_deref().filter(|text| !text.is_empty()),
        };
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
