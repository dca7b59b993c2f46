//! Response helpers.
//!
//! # Responsibilities
//! - Render errors as `{"error": "<message>", "code": <status>}`
//! - Render successful payloads as JSON
//!
//! # Design Decisions
//! - Clients only ever see a message and a code; source chains stay in logs
//! - Limiter headers are merged by the pipeline, not here

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    let body = ErrorBody {
        error: message.to_string(),
        code: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = error_response(StatusCode::TOO_MANY_REQUESTS, "You are being rate limited");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": "You are being rate limited", "code": 429})
        );
    }
}
