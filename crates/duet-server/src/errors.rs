//! HTTP error mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use duet_core::ValidationError;
use duet_store::StoreError;
use serde_json::json;
use tracing::error;

use crate::live::AdmissionError;

/// Every failure a request handler can return.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing x-duet-user header")]
    Unauthenticated,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RateLimited(#[from] AdmissionError),

    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(v) => Self::Validation(v),
            other => Self::Store(other),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Validation(ValidationError::NotParticipant(..)) => StatusCode::FORBIDDEN,
            Self::Validation(ValidationError::UnknownMessage(_)) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Validation(v) => v.error_kind(),
            Self::RateLimited(a) => a.reason(),
            Self::Store(_) => "store_failure",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        let mut response = (status, body).into_response();
        if let Self::RateLimited(e) = &self {
            // Retry-After is whole seconds; round up so clients never retry early.
            let secs = e.retry_after().as_millis().div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                let _ = response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn statuses() {
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(ValidationError::EmptyText).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ValidationError::NotParticipant("m".into(), "r".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(StoreError::Database("locked".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_validation_unwraps() {
        let err = ApiError::from(StoreError::Validation(ValidationError::EmptyText));
        assert_eq!(err.code(), "empty_text");
    }

    #[test]
    fn rate_limit_sets_retry_after() {
        let err = ApiError::from(AdmissionError::TooFrequent {
            retry_after: Duration::from_millis(1_200),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
