//! Request middleware.

pub mod pipeline;

pub use pipeline::request_pipeline;
