//! Gateway-level error responses.
//!
//! Errors surface at the HTTP boundary as short plain-text bodies; internal
//! detail goes to the structured log and never to the client.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors a request can surface to the client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Payload parse or validation failure.
    #[error("{0}")]
    BadRequest(String),

    /// Auth gate rejection; the reason stays coarse on the wire.
    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),

    /// Role gate rejection.
    #[error("Forbidden: insufficient permissions")]
    Forbidden,

    /// Lookup miss.
    #[error("{0}")]
    NotFound(String),

    /// Rate limiter denial; carries a minimum retry-after hint.
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimited,

    /// Requested operation conflicts with the record's current state.
    #[error("{0}")]
    Conflict(String),

    /// No healthy instances for the requested service.
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// Upstream transport failure during proxying.
    #[error("Bad Gateway")]
    BadGateway,

    /// Unexpected internal state; detail is logged, not returned.
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            tracing::error!("internal error: {}", detail);
        }

        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();

        if matches!(self, ApiError::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("no token provided").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::ServiceUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let response = ApiError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("1")
        );
    }

    #[test]
    fn test_rejection_bodies_are_short() {
        assert_eq!(ApiError::ServiceUnavailable.to_string(), "Service unavailable");
        assert_eq!(ApiError::BadGateway.to_string(), "Bad Gateway");
        assert_eq!(
            ApiError::RateLimited.to_string(),
            "Rate limit exceeded. Please try again later."
        );
        // Internal detail never reaches the body.
        assert_eq!(
            ApiError::Internal("secret detail".into()).to_string(),
            "Internal server error"
        );
    }
}
