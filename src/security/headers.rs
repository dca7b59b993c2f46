//! Rate-limit response headers.
//!
//! # Responsibilities
//! - Name the `RateLimit-*` headers in one place
//! - Write numeric header values without allocating a parser round-trip
//!
//! Header names are lower-case on the wire (HTTP/2 requires it); clients
//! match them case-insensitively.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Every header the limiter may write, for merging into a response.
pub const LIMITER_HEADERS: [HeaderName; 4] = [
    RATELIMIT_LIMIT,
    RATELIMIT_REMAINING,
    RATELIMIT_RESET,
    RETRY_AFTER,
];

/// Set `name` to the decimal rendering of `value`, replacing any previous
/// value.
pub fn set_numeric(headers: &mut HeaderMap, name: HeaderName, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

/// Copy the limiter headers from `from` into `to`.
pub fn merge_limiter_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for name in LIMITER_HEADERS {
        if let Some(value) = from.get(&name) {
            to.insert(name, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_copies_only_limiter_headers() {
        let mut from = HeaderMap::new();
        set_numeric(&mut from, RATELIMIT_LIMIT, 2);
        set_numeric(&mut from, RETRY_AFTER, 4);
        from.insert("x-other", HeaderValue::from_static("y"));

        let mut to = HeaderMap::new();
        merge_limiter_headers(&from, &mut to);

        assert_eq!(to.get("RateLimit-Limit").unwrap(), "2");
        assert_eq!(to.get("Retry-After").unwrap(), "4");
        assert!(to.get("x-other").is_none());
        assert!(to.get(RATELIMIT_REMAINING).is_none());
    }
}
