//! Error types for the query frontend.

use axum::http::StatusCode;
use thiserror::Error;

/// Result type for frontend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the query frontend.
///
/// Each variant maps onto an HTTP status via [`Error::status_code`]:
/// client mistakes are 400s, downstream failures keep their original
/// status, everything else is a 500.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request is malformed or violates a tenant limit.
    #[error("{0}")]
    BadRequest(String),

    /// The downstream backend answered with a non-2xx status.
    /// Status and body are preserved verbatim.
    #[error("downstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A codec mismatch, unsupported payload, or I/O failure inside
    /// the frontend.
    #[error("{0}")]
    Internal(String),

    /// The request context was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// HTTP status code this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Error returned when the series limiter trips.
    pub(crate) fn too_many_series(max_series: usize) -> Self {
        Error::BadRequest(format!(
            "maximum of series ({}) reached for a single query",
            max_series
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_variants_to_status_codes() {
        // given/when/then
        assert_eq!(
            Error::bad_request("nope").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::Cancelled.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn should_preserve_upstream_status() {
        // given
        let err = Error::Upstream {
            status: 429,
            body: "slow down".to_string(),
        };

        // when/then
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn should_fall_back_to_bad_gateway_for_invalid_upstream_status() {
        // given
        let err = Error::Upstream {
            status: 9999,
            body: String::new(),
        };

        // when/then
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
