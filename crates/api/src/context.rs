//! Caller context extracted from request headers.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use common::RequestContext;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Extractor wrapping the [`RequestContext`] handed to the reservation service.
///
/// `x-user-id` becomes the actor; `x-correlation-id` is propagated, or a
/// fresh one is generated when the caller sent none.
#[derive(Debug, Clone)]
pub struct Caller(pub RequestContext);

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        Caller(RequestContext {
            actor: header(USER_ID_HEADER),
            correlation_id: header(CORRELATION_ID_HEADER)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_headers(&parts.headers))
    }
}
