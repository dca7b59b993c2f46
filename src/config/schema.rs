//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files and
//! every section has defaults, so an empty file is a valid local setup.

use serde::{Deserialize, Serialize};

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Deployment environment; `local` runs entirely in memory.
    pub environment: Environment,

    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Per-IP rate limiter.
    pub limiter: LimiterSettings,

    /// One breaker per dependency.
    pub breakers: BreakersConfig,

    /// Key/value store connection.
    pub kv: KvConfig,

    /// Request-scoped loaders.
    pub loader: LoaderConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Startup retry settings.
    pub startup: StartupConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Development,
    Production,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Sliding-window limiter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Disabled limiters are skipped by the pipeline.
    pub enabled: bool,

    /// Key namespace: `rl:{name}:...`.
    pub name: String,

    /// Requests admitted per window.
    pub limit_per_minute: u64,

    pub window_interval_secs: u64,

    /// Must divide `window_interval_secs`.
    pub bucket_interval_secs: u64,

    /// Emit `RateLimit-*` headers.
    pub write_headers: bool,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "api".to_string(),
            limit_per_minute: 120,
            window_interval_secs: 60,
            bucket_interval_secs: 5,
            write_headers: true,
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Failure ratio in (0, 1] at which the breaker opens.
    pub error_ratio_threshold: f64,

    /// Outcomes needed in the window before the ratio is evaluated.
    pub min_samples: u32,

    pub open_duration_ms: u64,

    pub half_open_probes: u32,

    /// Trailing window of outcomes in seconds.
    pub sample_window_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            error_ratio_threshold: 0.5,
            min_samples: 10,
            open_duration_ms: 5_000,
            half_open_probes: 1,
            sample_window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BreakersConfig {
    /// Guards every key/value command.
    pub kv: BreakerSettings,

    /// Guards every directory query.
    pub directory: BreakerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvBackendKind {
    /// In-process store; state is lost on restart.
    #[default]
    Memory,
    Redis,
}

/// Key/value store connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KvConfig {
    pub backend: KvBackendKind,

    /// `host:port` or a `redis://` URL.
    pub addr: String,

    pub dial_timeout_ms: u64,

    pub read_timeout_ms: u64,

    /// Connections unused for this long are closed by the reaper.
    pub idle_timeout_secs: u64,

    pub idle_check_every_secs: u64,

    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: KvBackendKind::Memory,
            addr: "127.0.0.1:6379".to_string(),
            dial_timeout_ms: 5_000,
            read_timeout_ms: 500,
            idle_timeout_secs: 20,
            idle_check_every_secs: 15,
            pool_size: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Keys per batch; 0 means unbounded.
    pub max_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { max_batch_size: 100 }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// Grace period for in-flight requests on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Retries while connecting to dependencies at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "userdir=debug,tower_http=debug".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.environment, Environment::Local);
        assert_eq!(config.kv.dial_timeout_ms, 5_000);
        assert_eq!(config.kv.read_timeout_ms, 500);
        assert_eq!(config.kv.idle_timeout_secs, 20);
        assert_eq!(config.kv.idle_check_every_secs, 15);
        assert_eq!(config.breakers.kv.timeout_ms, 500);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: ServiceConfig = toml::from_str(
            r#"
            environment = "production"

            [limiter]
            limit_per_minute = 2

            [kv]
            backend = "redis"
            addr = "cache:6379"

            [breakers.directory]
            min_samples = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.limiter.limit_per_minute, 2);
        assert_eq!(config.limiter.bucket_interval_secs, 5);
        assert_eq!(config.kv.backend, KvBackendKind::Redis);
        assert_eq!(config.kv.pool_size, 16);
        assert_eq!(config.breakers.directory.min_samples, 5);
        assert_eq!(config.breakers.kv.min_samples, 10);
    }
}
