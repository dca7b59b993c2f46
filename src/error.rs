//! Service-wide error taxonomy.
//!
//! Every subsystem has its own `thiserror` enum; at the HTTP boundary they
//! all converge on [`AppError`], which knows its [`ErrorKind`] and therefore
//! its status code. The source chain is kept for logging only; clients see
//! the message and the code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::directory::StoreError;
use crate::http::response::error_response;
use crate::kv::KvError;
use crate::loaders::LoaderError;
use crate::resilience::circuit_breaker::BreakerError;

/// Error kinds, independent of which subsystem produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Unauthorized,
    Throttled,
    Timeout,
    BreakerOpen,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Throttled => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Backend => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an error of this kind is a downstream fault that a breaker
    /// should count.
    pub fn is_downstream_fault(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Backend)
    }
}

type Source = Box<dyn std::error::Error + Send + Sync>;

/// An error on its way to the client.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Source>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `source`, keeping it in the chain for logs.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, source: impl Into<Source>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn throttled() -> Self {
        Self::new(ErrorKind::Throttled, "You are being rate limited")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::Internal || self.kind.is_downstream_fault() {
            tracing::error!(
                kind = ?self.kind,
                error = %self.message,
                source = ?self.source,
                "Request failed"
            );
        }
        error_response(self.status(), &self.message)
    }
}

impl<E> From<BreakerError<E>> for AppError
where
    E: std::error::Error + Send + Sync + 'static,
    AppError: From<E>,
{
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { .. } => AppError::wrap(
                ErrorKind::BreakerOpen,
                "Service temporarily unavailable",
                err.to_string(),
            ),
            BreakerError::Timeout { .. } => {
                AppError::wrap(ErrorKind::Timeout, "Upstream timed out", err.to_string())
            }
            BreakerError::Cancelled => AppError::new(ErrorKind::BadRequest, "Request cancelled"),
            BreakerError::Inner(inner) => AppError::from(inner),
        }
    }
}

impl From<KvError> for AppError {
    fn from(err: KvError) -> Self {
        let kind = match &err {
            KvError::NotFound(_) => ErrorKind::NotFound,
            KvError::Parse { .. } | KvError::Rejected(_) => ErrorKind::BadRequest,
            KvError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            KvError::Timeout(_) => ErrorKind::Timeout,
            KvError::Cancelled => ErrorKind::BadRequest,
            KvError::Backend(_) | KvError::Closed => ErrorKind::Backend,
        };
        let message = match kind {
            ErrorKind::Backend => "Cache unavailable".to_string(),
            ErrorKind::BreakerOpen => "Service temporarily unavailable".to_string(),
            ErrorKind::Timeout => "Upstream timed out".to_string(),
            _ => err.to_string(),
        };
        AppError::wrap(kind, message, err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::InvalidInput(_) | StoreError::Cancelled => ErrorKind::BadRequest,
            StoreError::Unavailable(_) => ErrorKind::Backend,
            StoreError::BreakerOpen(_) => ErrorKind::BreakerOpen,
            StoreError::Timeout(_) => ErrorKind::Timeout,
        };
        let message = match kind {
            ErrorKind::Backend => "Datastore unavailable".to_string(),
            ErrorKind::BreakerOpen => "Service temporarily unavailable".to_string(),
            ErrorKind::Timeout => "Upstream timed out".to_string(),
            _ => err.to_string(),
        };
        AppError::wrap(kind, message, err)
    }
}

impl From<LoaderError> for AppError {
    fn from(err: LoaderError) -> Self {
        let (kind, message) = match &err {
            LoaderError::Cancelled => (ErrorKind::BadRequest, "Request cancelled".to_string()),
            LoaderError::Fetch { kind, message } => (*kind, message.clone()),
            LoaderError::Misaligned { .. } => {
                (ErrorKind::Internal, "Internal server error".to_string())
            }
        };
        AppError::wrap(kind, message, err)
    }
}
