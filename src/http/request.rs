//! Request-scoped state available to handlers.
//!
//! # Responsibilities
//! - Hand handlers the request's context and loader set
//! - Parse path parameters whose domain is integral
//!
//! # Design Decisions
//! - The pipeline is the only writer of the scope; handlers only read it
//! - A handler reached without the pipeline is a wiring bug (500), not a
//!   client error

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::context::RequestContext;
use crate::error::AppError;
use crate::loaders::LoaderSet;

/// The request's context plus its loaders.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub ctx: RequestContext,
    pub loaders: LoaderSet,
}

impl<S> FromRequestParts<S> for RequestScope
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestScope>().cloned().ok_or_else(|| {
            tracing::error!(
                path = %parts.uri.path(),
                "Request scope missing; pipeline not installed"
            );
            AppError::internal("Internal server error")
        })
    }
}

/// Parse an integer id from a path segment.
pub fn parse_id(raw: &str) -> Result<i64, AppError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| AppError::bad_request(format!("'{raw}' is not a valid id")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("42").unwrap(), 42);
        assert_eq!(parse_id("-1").unwrap(), -1);
        assert_eq!(parse_id("abc").unwrap_err().kind(), ErrorKind::BadRequest);
        assert_eq!(parse_id("").unwrap_err().kind(), ErrorKind::BadRequest);
    }
}
