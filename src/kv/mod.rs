//! Key/value store subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter / cache users
//!     → client.rs (KvClient: breaker-wrapped façade, typed getters)
//!     → KvBackend capability
//!         → redis_backend.rs (deadpool-redis pool, Lua scripts, idle reaper)
//!         → memory.rs (in-process fake: TTLs, atomic script emulation,
//!                      fault injection)
//! ```
//!
//! # Design Decisions
//! - The connection pool is built once at startup and passed by reference
//! - A missing key is a typed `NotFound`, never a breaker failure
//! - Scripts carry both their Lua source and a native emulation so the
//!   in-memory backend runs them with the same atomicity guarantee

pub mod client;
pub mod memory;
pub mod redis_backend;

use std::time::Duration;
use async_trait::async_trait;

use crate::resilience::FailureClass;

pub use client::KvClient;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// Errors from the key/value subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("could not parse value {value:?} for key {key}")]
    Parse { key: String, value: String },

    /// The backend refused the command (wrong type, script error).
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Connection, pool or I/O failure.
    #[error("kv backend error: {0}")]
    Backend(String),

    #[error("circuit '{0}' is open")]
    BreakerOpen(String),

    #[error("kv call timed out after {0:?}")]
    Timeout(Duration),

    #[error("kv call cancelled")]
    Cancelled,

    #[error("kv client is closed")]
    Closed,
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}

impl FailureClass for KvError {
    fn is_failure(&self) -> bool {
        matches!(self, KvError::Backend(_) | KvError::Timeout(_))
    }
}

/// A reply from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvValue {
    Nil,
    Int(i64),
    Str(String),
    Array(Vec<KvValue>),
}

impl KvValue {
    /// Integer view; numeric strings are accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KvValue::Int(i) => Some(*i),
            KvValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<KvValue>> {
        match self {
            KvValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// The view of the keyspace a script's native emulation runs against.
///
/// Implementations hold whatever lock makes the whole script atomic.
pub trait ScriptEnv {
    fn get(&mut self, key: &str) -> Option<String>;
    fn incr_by(&mut self, key: &str, by: i64) -> Result<i64, KvError>;
    /// Returns `false` when the key does not exist.
    fn expire(&mut self, key: &str, ttl: Duration) -> bool;
}

/// Native emulation of a script: `(env, KEYS, ARGV) -> reply`.
pub type ScriptFn = fn(&mut dyn ScriptEnv, &[String], &[String]) -> Result<KvValue, KvError>;

/// A server-side script.
#[derive(Clone, Copy)]
pub struct Script {
    name: &'static str,
    source: &'static str,
    emulate: ScriptFn,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str, emulate: ScriptFn) -> Self {
        Self {
            name,
            source,
            emulate,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source sent to Redis.
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Run the native emulation.
    pub fn emulate(
        &self,
        env: &mut dyn ScriptEnv,
        keys: &[String],
        args: &[String],
    ) -> Result<KvValue, KvError> {
        (self.emulate)(env, keys, args)
    }
}

/// Raw key/value operations. [`KvClient`] adds the breaker on top.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// `ttl` of `None` stores the key without expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Number of keys removed.
    async fn del(&self, key: &str) -> Result<u64, KvError>;

    /// Number of the given keys that exist.
    async fn exists(&self, key: &str) -> Result<u64, KvError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;

    /// Run `script` atomically.
    async fn eval(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<KvValue, KvError>;

    async fn ping(&self) -> Result<(), KvError>;

    async fn close(&self) -> Result<(), KvError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}
