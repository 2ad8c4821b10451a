//! Caller identity, as asserted by the login layer in front of the server.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use duet_core::UserId;

use crate::errors::ApiError;

pub const IDENTITY_HEADER: &str = "x-duet-user";

/// The authenticated user of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(UserId::from(v)))
            .ok_or(ApiError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<Identity, ApiError> {
        let mut builder = Request::builder().uri("/");
        if let Some(h) = header {
            builder = builder.header(IDENTITY_HEADER, h);
        }
        let (mut parts, ()) = builder.body(()).unwrap().into_parts();
        Identity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_header() {
        assert_eq!(extract(Some(" alice ")).await.unwrap().0, UserId::from("alice"));
    }

    #[tokio::test]
    async fn missing_or_blank_is_rejected() {
        assert_matches!(extract(None).await, Err(ApiError::Unauthenticated));
        assert_matches!(extract(Some("  ")).await, Err(ApiError::Unauthenticated));
    }
}
