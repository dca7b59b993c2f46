//! User directory service library.

pub mod clock;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod loaders;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::ServiceConfig;
pub use context::RequestContext;
pub use error::{AppError, ErrorKind};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
