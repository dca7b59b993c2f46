//! Startup orchestration.
//!
//! # Responsibilities
//! - Build one breaker per dependency from config
//! - Connect the KV backend (retrying with backoff) and start its reaper
//! - Build the directory store, limiter and loader factory
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener is bound by the caller, after this returns

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::{Environment, KvBackendKind, ServiceConfig};
use crate::directory::{DirectoryStore, GuardedDirectory, MemoryDirectory};
use crate::http::AppState;
use crate::kv::{KvBackend, KvClient, KvError, MemoryBackend, RedisBackend};
use crate::lifecycle::Shutdown;
use crate::loaders::Loaders;
use crate::resilience::backoff::retry_with_backoff;
use crate::resilience::{Breaker, BreakerConfig};
use crate::security::{LimiterError, LimiterOptions, RateLimiter};

/// Breaker guarding the KV store.
pub const KV_BREAKER: &str = "redis_userdb";
/// Breaker guarding the directory store.
pub const DIRECTORY_BREAKER: &str = "postgres_userdb";

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("KV backend unavailable: {0}")]
    Kv(#[from] KvError),

    #[error("invalid limiter configuration: {0}")]
    Limiter(#[from] LimiterError),
}

/// Everything `main` needs to serve and later drain.
pub struct Services {
    pub state: AppState,
    /// Tasks stopped by the shutdown broadcast.
    pub background: Vec<JoinHandle<()>>,
}

/// Build the application from `config`.
pub async fn bootstrap(
    config: ServiceConfig,
    clock: SharedClock,
    shutdown: &Shutdown,
) -> Result<Services, StartupError> {
    let config = Arc::new(config);
    let mut background = Vec::new();

    let kv_breaker = Arc::new(Breaker::new(KV_BREAKER, BreakerConfig::from(&config.breakers.kv)));
    let backend: Arc<dyn KvBackend> = match config.kv.backend {
        KvBackendKind::Memory => {
            if config.environment == Environment::Production {
                tracing::warn!("In-memory KV backend in production; limits are per process");
            }
            tracing::info!("Using in-memory KV backend");
            Arc::new(MemoryBackend::new(clock.clone()))
        }
        KvBackendKind::Redis => {
            let kv = &config.kv;
            let startup = &config.startup;
            let redis = retry_with_backoff(
                "redis connect",
                startup.max_attempts,
                startup.base_delay_ms,
                startup.max_delay_ms,
                || RedisBackend::connect(kv),
            )
            .await?;
            let every = Duration::from_secs(kv.idle_check_every_secs);
            background.push(redis.spawn_idle_reaper(every, shutdown.subscribe()));
            Arc::new(redis)
        }
    };
    let kv = KvClient::new(backend, kv_breaker);

    let store: Arc<dyn DirectoryStore> = Arc::new(MemoryDirectory::seeded());
    let state = build_state(config, clock, kv, store)?;

    Ok(Services { state, background })
}

/// Assemble the request-facing state around an existing KV client and an
/// unguarded directory store.
pub fn build_state(
    config: Arc<ServiceConfig>,
    clock: SharedClock,
    kv: KvClient,
    store: Arc<dyn DirectoryStore>,
) -> Result<AppState, StartupError> {
    let directory_breaker = Arc::new(Breaker::new(
        DIRECTORY_BREAKER,
        BreakerConfig::from(&config.breakers.directory),
    ));
    let directory: Arc<dyn DirectoryStore> =
        Arc::new(GuardedDirectory::new(store, directory_breaker));

    let limiter = if config.limiter.enabled {
        let options = LimiterOptions::from(&config.limiter);
        tracing::info!(
            limiter = %options.name,
            limit = options.limit_per_minute,
            window = ?options.window_interval,
            bucket = ?options.bucket_interval,
            "Rate limiter enabled"
        );
        Some(RateLimiter::new(kv.clone(), clock, options)?)
    } else {
        tracing::info!("Rate limiter disabled");
        None
    };

    let loaders = Loaders::new(directory.clone(), config.loader.max_batch_size);

    Ok(AppState {
        config,
        kv,
        limiter,
        loaders,
        directory,
    })
}
